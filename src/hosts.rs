//! Hosts-file publishing.
//!
//! dnsmasq reads every file inside its `--hostsdir`. We own exactly one of
//! them, `hosts`, and regenerate it from scratch on each publish. The new
//! content is written to a dot-file next to it and renamed into place, so the
//! resolver never sees a truncated file. dnsmasq skips dot-files when
//! scanning the directory.

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::inventory::Inventory;
use crate::types::ContainerRecord;

pub const HOSTS_FILE_NAME: &str = "hosts";
const STAGING_FILE_NAME: &str = ".hosts.tmp";

pub struct HostsWriter {
    path: PathBuf,
    staging: PathBuf,
}

impl HostsWriter {
    pub fn new(hosts_folder: &Path) -> Self {
        Self {
            path: hosts_folder.join(HOSTS_FILE_NAME),
            staging: hosts_folder.join(STAGING_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the published file with the rendering of `inventory`.
    pub async fn publish(&self, inventory: &Inventory) -> Result<()> {
        let content = render(&self.path, inventory);
        tokio::fs::write(&self.staging, content.as_bytes())
            .await
            .map_err(|e| Error::publish(&self.staging, e))?;
        tokio::fs::rename(&self.staging, &self.path)
            .await
            .map_err(|e| Error::publish(&self.path, e))?;
        debug!(
            "Published {} records to {}",
            inventory.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Renders the whole file: a header naming `path`, then one line per record
/// that has an address.
pub fn render(path: &Path, inventory: &Inventory) -> String {
    let mut out = format!("#  {}\n", path.display());
    for line in inventory.records().filter_map(render_line) {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Address followed by every dotted name, tab separated. dnsmasq only takes
/// domain names here, so single-label names are dropped; when none is left
/// the line is commented out. Records without an address render nothing.
pub fn render_line(record: &ContainerRecord) -> Option<String> {
    if !record.has_address() {
        return None;
    }
    let mut fields = vec![record.address.as_str()];
    fields.extend(
        record
            .hostnames()
            .iter()
            .map(String::as_str)
            .filter(|name| name.contains('.')),
    );
    let line = fields.join("\t");
    if fields.len() == 1 {
        Some(format!("# {line}"))
    } else {
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContainerIdentity;

    fn record(id: &str, address: Option<&str>, domain: &str) -> ContainerRecord {
        ContainerRecord::new(
            id,
            ContainerIdentity {
                hostname: "web".into(),
                domain: domain.into(),
                container_name: "/app".into(),
                address: address.map(String::from),
            },
        )
    }

    #[test]
    fn single_label_names_are_commented_out() {
        let line = render_line(&record("a", Some("10.0.0.5"), "")).unwrap();
        assert_eq!(line, "# 10.0.0.5");
    }

    #[test]
    fn fqdn_names_are_kept() {
        let line = render_line(&record("a", Some("10.0.0.5"), "example.com")).unwrap();
        assert_eq!(line, "10.0.0.5\tweb.example.com\tapp.example.com");
    }

    #[test]
    fn dotted_hostname_survives_without_domain() {
        let rec = ContainerRecord::new(
            "a",
            ContainerIdentity {
                hostname: "db.internal".into(),
                container_name: "/db".into(),
                address: Some("10.0.0.9".into()),
                ..Default::default()
            },
        );
        assert_eq!(render_line(&rec).unwrap(), "10.0.0.9\tdb.internal");
    }

    #[test]
    fn addressless_record_is_skipped() {
        assert_eq!(render_line(&record("a", None, "example.com")), None);
    }

    #[test]
    fn render_keeps_inventory_order() {
        let inventory: Inventory = [
            record("b", Some("10.0.0.2"), "lan"),
            record("a", Some("10.0.0.1"), ""),
        ]
        .into_iter()
        .collect();
        let text = render(Path::new("/run/h/hosts"), &inventory);
        assert_eq!(
            text,
            "#  /run/h/hosts\n10.0.0.2\tweb.lan\tapp.lan\n# 10.0.0.1\n"
        );
    }

    #[test]
    fn empty_inventory_is_header_only() {
        let text = render(Path::new("/run/h/hosts"), &Inventory::default());
        assert_eq!(text, "#  /run/h/hosts\n");
    }

    #[tokio::test]
    async fn publish_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = HostsWriter::new(dir.path());

        let inventory: Inventory = [record("a", Some("10.0.0.1"), "lan")].into_iter().collect();
        writer.publish(&inventory).await.unwrap();
        writer.publish(&Inventory::default()).await.unwrap();

        let content = std::fs::read_to_string(writer.path()).unwrap();
        assert_eq!(content, format!("#  {}\n", writer.path().display()));
        assert!(!dir.path().join(STAGING_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn publish_into_missing_folder_fails() {
        let dir = tempfile::tempdir().unwrap();
        let writer = HostsWriter::new(&dir.path().join("gone"));
        let err = writer.publish(&Inventory::default()).await.unwrap_err();
        assert!(matches!(err, Error::Publish { .. }));
    }
}

//! Container identity as reported by the runtime and the DNS record set
//! derived from it.

/// What the runtime tells us about one running container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerIdentity {
    pub hostname: String,
    /// Domain name attribute; empty when the container has none.
    pub domain: String,
    /// Container name without the leading `/`.
    pub container_name: String,
    /// Address on the first attached network, if any. Multi-network
    /// containers are only reachable under this one address.
    pub address: Option<String>,
}

/// The DNS-relevant record of one running container.
///
/// `names` always starts with the address, followed by the hostname and the
/// alias (container name), then their fully qualified forms when the
/// container has a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    pub address: String,
    pub names: Vec<String>,
}

impl ContainerRecord {
    pub fn new(id: impl Into<String>, identity: ContainerIdentity) -> Self {
        let ContainerIdentity {
            hostname,
            domain,
            container_name,
            address,
        } = identity;
        let address = address.unwrap_or_default();
        let alias = container_name.trim_start_matches('/').to_string();

        let mut names = vec![address.clone(), hostname.clone(), alias.clone()];
        if !domain.is_empty() {
            names.push(format!("{hostname}.{domain}"));
            names.push(format!("{alias}.{domain}"));
        }

        Self {
            id: id.into(),
            address,
            names,
        }
    }

    /// Hostname and alias forms, without the leading address.
    pub fn hostnames(&self) -> &[String] {
        self.names.get(1..).unwrap_or_default()
    }

    pub fn has_address(&self) -> bool {
        !self.address.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(domain: &str) -> ContainerIdentity {
        ContainerIdentity {
            hostname: "web".into(),
            domain: domain.into(),
            container_name: "/app".into(),
            address: Some("10.0.0.5".into()),
        }
    }

    #[test]
    fn names_without_domain() {
        let record = ContainerRecord::new("abc123", identity(""));
        assert_eq!(record.names, vec!["10.0.0.5", "web", "app"]);
        assert_eq!(record.hostnames(), ["web", "app"]);
    }

    #[test]
    fn names_with_domain_add_fqdn_forms() {
        let record = ContainerRecord::new("abc123", identity("example.com"));
        assert_eq!(
            record.names,
            vec![
                "10.0.0.5",
                "web",
                "app",
                "web.example.com",
                "app.example.com"
            ]
        );
    }

    #[test]
    fn missing_address_is_empty() {
        let mut id = identity("");
        id.address = None;
        let record = ContainerRecord::new("abc123", id);
        assert!(!record.has_address());
        assert_eq!(record.names[0], "");
    }
}

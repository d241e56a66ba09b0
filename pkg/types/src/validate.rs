use anyhow::{Result, bail};

const DNS1123_LABEL_MAX: usize = 63;
const DNS1123_SUBDOMAIN_MAX: usize = 253;
const QUALIFIED_NAME_MAX: usize = 63;

/// Validate an object name (DNS-1123 label).
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > DNS1123_LABEL_MAX {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if !is_dns1123_label(name) {
        bail!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-] and start and end with an alphanumeric",
            name
        );
    }
    Ok(())
}

/// Validate a resource name used as a quota key (e.g. `requests.cpu`,
/// `count/pods`, `requests.nvidia.com/gpu`).
pub fn validate_resource_name(name: &str) -> Result<()> {
    if !is_qualified_name(name) {
        bail!("resource name '{}' is not a valid qualified name", name);
    }
    Ok(())
}

fn is_dns1123_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= DNS1123_LABEL_MAX
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

fn is_dns1123_subdomain(s: &str) -> bool {
    !s.is_empty() && s.len() <= DNS1123_SUBDOMAIN_MAX && s.split('.').all(is_dns1123_label)
}

/// `[prefix/]name` where the optional prefix is a DNS subdomain and the
/// name is at most 63 chars of `[A-Za-z0-9-_.]`, alphanumeric at both ends.
pub fn is_qualified_name(value: &str) -> bool {
    let name = match value.split_once('/') {
        Some((prefix, name)) => {
            if !is_dns1123_subdomain(prefix) {
                return false;
            }
            name
        }
        None => value,
    };
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= QUALIFIED_NAME_MAX
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(validate_name("team-a").is_ok());
        assert!(validate_name("quota-123").is_ok());
        assert!(validate_name("a").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("Team-A").is_err());
        assert!(validate_name("team_a").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("trailing-").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn qualified_resource_names() {
        assert!(validate_resource_name("cpu").is_ok());
        assert!(validate_resource_name("requests.memory").is_ok());
        assert!(validate_resource_name("count/pods").is_ok());
        assert!(validate_resource_name("requests.nvidia.com/gpu").is_ok());
        assert!(validate_resource_name("hugepages-2Mi").is_ok());
        assert!(validate_resource_name("bad name").is_err());
        assert!(validate_resource_name("Example.com/gpu").is_err());
        assert!(validate_resource_name("example.com/").is_err());
    }
}

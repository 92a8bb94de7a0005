//! Credential material for external services.

use crate::{Error, ErrorContext, Result};
use keyring::Entry;
use sha2::{Digest, Sha256};
use std::env;
use std::fmt;

const KEYRING_SERVICE: &str = "intake-orchestrator";

/// One access key. The secret never appears in `Debug` output or logs.
#[derive(Clone)]
pub struct Credential {
    label: String,
    secret: Option<String>,
}

impl Credential {
    pub fn new(label: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            secret: Some(secret.into()),
        }
    }

    /// For services that need no authentication.
    pub fn anonymous() -> Self {
        Self {
            label: "anonymous".to_string(),
            secret: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    /// Short SHA-256 fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        match &self.secret {
            Some(s) => {
                let digest = Sha256::digest(s.as_bytes());
                digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
            }
            None => "-".to_string(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.label)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

fn lookup(service: &str, name: &str) -> Option<String> {
    // 1. Keyring
    if let Ok(entry) = Entry::new(KEYRING_SERVICE, &format!("{}/{}", service, name)) {
        if let Ok(key) = entry.get_password() {
            return Some(key);
        }
    }
    // 2. Environment variable
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Resolve the credentials named in a service's configuration, keeping their priority order.
///
/// Names that resolve to nothing are skipped; if none resolve the service cannot be called.
pub fn resolve_credentials(service: &str, names: &[String]) -> Result<Vec<Credential>> {
    if names.is_empty() {
        return Ok(vec![Credential::anonymous()]);
    }
    let found: Vec<Credential> = names
        .iter()
        .filter_map(|name| lookup(service, name).map(|secret| Credential::new(name, secret)))
        .collect();
    if found.is_empty() {
        return Err(Error::configuration_with_context(
            format!("no credentials available for service '{}'", service),
            ErrorContext::new()
                .with_field_path(format!("services.{}.credentials", service))
                .with_details(names.join(", "))
                .with_source("credentials"),
        ));
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_secret() {
        let c = Credential::new("OCR_API_KEY", "sk-very-secret");
        let shown = format!("{:?}", c);
        assert!(!shown.contains("sk-very-secret"));
        assert!(shown.contains("OCR_API_KEY"));
        assert_eq!(c.fingerprint().len(), 8);
    }

    #[test]
    fn test_empty_names_means_anonymous() {
        let creds = resolve_credentials("local", &[]).unwrap();
        assert_eq!(creds.len(), 1);
        assert!(creds[0].secret().is_none());
    }

    #[test]
    fn test_env_resolution_keeps_order_and_skips_missing() {
        env::set_var("INTAKE_TEST_CRED_PRIMARY", "k1");
        env::set_var("INTAKE_TEST_CRED_BACKUP", "k2");
        let names = vec![
            "INTAKE_TEST_CRED_PRIMARY".to_string(),
            "INTAKE_TEST_CRED_MISSING".to_string(),
            "INTAKE_TEST_CRED_BACKUP".to_string(),
        ];
        let creds = resolve_credentials("ocr-test", &names).unwrap();
        let labels: Vec<&str> = creds.iter().map(|c| c.label()).collect();
        assert_eq!(labels, vec!["INTAKE_TEST_CRED_PRIMARY", "INTAKE_TEST_CRED_BACKUP"]);
        assert_eq!(creds[1].secret(), Some("k2"));
    }

    #[test]
    fn test_nothing_resolved_is_configuration_error() {
        let names = vec!["INTAKE_TEST_CRED_NEVER_SET".to_string()];
        let err = resolve_credentials("ocr-test", &names).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}

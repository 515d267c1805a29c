//! In-place transformations applied to a freshly cloned application directory

use std::collections::BTreeMap;
use std::path::Path;

use regex::Captures;

use crate::config::application::{Attachment, SecretEncryption};
use crate::errors::PipedError;
use crate::regexpool;

const SECRET_TEMPLATE: &str = r"\{\{\s*\.(?:encryptedSecrets|encryptedItems)\.([A-Za-z0-9_\-]+)\s*\}\}";
const ATTACHMENT_TEMPLATE: &str = r"\{\{\s*\.attachment\.([A-Za-z0-9_\-\.]+)\s*\}\}";

/// Decrypts values sealed with the piped's key
pub trait SecretDecrypter: Send + Sync {
    fn decrypt(&self, encrypted: &str) -> Result<String, PipedError>;
}

/// Which transformations a source needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processing {
    None,
    SecretOnly,
    AttachmentOnly,
    Both,
}

impl Processing {
    pub fn of(encryption: Option<&SecretEncryption>, attachment: Option<&Attachment>) -> Self {
        let secrets = encryption
            .map(|e| !e.decryption_targets.is_empty())
            .unwrap_or(false);
        let attachments = attachment.map(|a| !a.targets.is_empty()).unwrap_or(false);
        match (secrets, attachments) {
            (false, false) => Processing::None,
            (true, false) => Processing::SecretOnly,
            (false, true) => Processing::AttachmentOnly,
            (true, true) => Processing::Both,
        }
    }
}

/// Replace `{{ .encryptedSecrets.KEY }}` in every decryption target with the decrypted value.
///
/// Every referenced key must be present in `encryptedSecrets`.
pub async fn decrypt_secrets(
    app_dir: &Path,
    encryption: &SecretEncryption,
    decrypter: &dyn SecretDecrypter,
) -> Result<(), PipedError> {
    let mut secrets = BTreeMap::new();
    for (key, encrypted) in &encryption.encrypted_secrets {
        let decrypted = decrypter
            .decrypt(encrypted)
            .map_err(|e| PipedError::Config(format!("failed to decrypt {} secret ({})", key, e)))?;
        secrets.insert(key.as_str(), decrypted);
    }

    let pattern = regexpool::default_pool().get(SECRET_TEMPLATE)?;
    for target in &encryption.decryption_targets {
        let path = app_dir.join(target);
        let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PipedError::Config(format!("failed to parse decryption target {} ({})", target, e))
        })?;

        let rendered = render(&pattern, &data, |key| secrets.get(key).cloned()).map_err(|key| {
            PipedError::Config(format!(
                "failed to render decryption target {} (map has no entry for key {:?})",
                target, key
            ))
        })?;
        tokio::fs::write(&path, rendered).await?;
    }
    Ok(())
}

/// Replace `{{ .attachment.NAME }}` in every target with the content of the named source file.
pub async fn attach(app_dir: &Path, attachment: &Attachment) -> Result<(), PipedError> {
    let mut contents = BTreeMap::new();
    for (name, source) in &attachment.sources {
        let data = tokio::fs::read_to_string(app_dir.join(source))
            .await
            .map_err(|e| {
                PipedError::Config(format!("failed to read attachment source {} ({})", source, e))
            })?;
        contents.insert(name.as_str(), data);
    }

    let pattern = regexpool::default_pool().get(ATTACHMENT_TEMPLATE)?;
    for target in &attachment.targets {
        let path = app_dir.join(target);
        let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PipedError::Config(format!("failed to parse attachment target {} ({})", target, e))
        })?;

        let rendered = render(&pattern, &data, |key| contents.get(key).cloned()).map_err(|key| {
            PipedError::Config(format!(
                "failed to render attachment target {} (map has no entry for key {:?})",
                target, key
            ))
        })?;
        tokio::fs::write(&path, rendered).await?;
    }
    Ok(())
}

/// Substitute every match; fails with the first key `lookup` has no value for.
fn render<F>(pattern: &regex::Regex, data: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = None;
    let rendered = pattern.replace_all(data, |caps: &Captures| {
        let key = &caps[1];
        match lookup(key) {
            Some(v) => v,
            None => {
                if missing.is_none() {
                    missing = Some(key.to_string());
                }
                String::new()
            }
        }
    });
    match missing {
        Some(key) => Err(key),
        None => Ok(rendered.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PrefixDecrypter;

    impl SecretDecrypter for PrefixDecrypter {
        fn decrypt(&self, encrypted: &str) -> Result<String, PipedError> {
            Ok(format!("decrypted-{}", encrypted))
        }
    }

    fn encryption(targets: &[&str]) -> SecretEncryption {
        let mut secrets = BTreeMap::new();
        secrets.insert("password".to_string(), "encrypted-password".to_string());
        secrets.insert("foo".to_string(), "encrypted-foo".to_string());
        SecretEncryption {
            encrypted_secrets: secrets,
            decryption_targets: targets.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_decrypt_secrets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/dir")).unwrap();
        std::fs::write(
            dir.path().join("sub/dir/resource.yaml"),
            "password: {{ .encryptedSecrets.password }}, foo: {{.encryptedItems.foo}}",
        )
        .unwrap();
        std::fs::write(dir.path().join("plain.yaml"), "resource-data").unwrap();

        decrypt_secrets(
            dir.path(),
            &encryption(&["sub/dir/resource.yaml", "plain.yaml"]),
            &PrefixDecrypter,
        )
        .await
        .unwrap();

        let data = std::fs::read_to_string(dir.path().join("sub/dir/resource.yaml")).unwrap();
        assert_eq!(
            data,
            "password: decrypted-encrypted-password, foo: decrypted-encrypted-foo"
        );
        let data = std::fs::read_to_string(dir.path().join("plain.yaml")).unwrap();
        assert_eq!(data, "resource-data");
    }

    #[tokio::test]
    async fn test_decrypt_secrets_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = decrypt_secrets(dir.path(), &encryption(&["missing.yaml"]), &PrefixDecrypter)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("failed to parse decryption target missing.yaml"));

        std::fs::write(
            dir.path().join("resource.yaml"),
            "{{ .encryptedSecrets.password }} {{ .encryptedSecrets.nonexistent }}",
        )
        .unwrap();
        let err = decrypt_secrets(dir.path(), &encryption(&["resource.yaml"]), &PrefixDecrypter)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("\"nonexistent\""));
    }

    #[tokio::test]
    async fn test_attach() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{\"debug\":true}").unwrap();
        std::fs::write(dir.path().join("configmap.yaml"), "data: '{{ .attachment.config }}'").unwrap();

        let mut sources = BTreeMap::new();
        sources.insert("config".to_string(), "config.json".to_string());
        let attachment = Attachment {
            sources,
            targets: vec!["configmap.yaml".to_string()],
        };
        attach(dir.path(), &attachment).await.unwrap();

        let data = std::fs::read_to_string(dir.path().join("configmap.yaml")).unwrap();
        assert_eq!(data, "data: '{\"debug\":true}'");
    }

    #[test]
    fn test_processing_of() {
        let enc = encryption(&["a.yaml"]);
        let att = Attachment {
            sources: BTreeMap::new(),
            targets: vec!["b.yaml".to_string()],
        };
        assert_eq!(Processing::of(None, None), Processing::None);
        assert_eq!(Processing::of(Some(&enc), None), Processing::SecretOnly);
        assert_eq!(Processing::of(None, Some(&att)), Processing::AttachmentOnly);
        assert_eq!(Processing::of(Some(&enc), Some(&att)), Processing::Both);
    }
}

//! Credential rewrites declared on a connection binding.

use std::collections::BTreeMap;

use credwarden_storage::{ResourceStore, Secret, StoreError};

use crate::resources::SecretTransform;

/// Decode a secret's values as UTF-8 strings, lossily.
#[must_use]
pub fn string_data(secret: &Secret) -> BTreeMap<String, String> {
    secret
        .data
        .iter()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
        .collect()
}

/// Apply `transforms` in order to `data`. `AddKeysFrom` reads the named
/// secret from `namespace`.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if an `AddKeysFrom` secret is missing.
pub async fn apply_transforms(
    secrets: &dyn ResourceStore<Secret>,
    namespace: &str,
    transforms: &[SecretTransform],
    data: &mut BTreeMap<String, String>,
) -> Result<(), StoreError> {
    for transform in transforms {
        match transform {
            SecretTransform::RenameKey { from, to } => {
                if let Some(value) = data.remove(from) {
                    data.insert(to.clone(), value);
                }
            }
            SecretTransform::AddKey { key, value } => {
                data.insert(key.clone(), value.clone());
            }
            SecretTransform::AddKeysFrom { secret_ref } => {
                let source = secrets
                    .get(namespace, &secret_ref.name)
                    .await?
                    .ok_or_else(|| StoreError::NotFound {
                        kind: "Secret",
                        key: format!("{namespace}/{}", secret_ref.name),
                    })?;
                data.extend(string_data(&source));
            }
            SecretTransform::RemoveKey { key } => {
                data.remove(key);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use credwarden_storage::{MemoryStore, ObjectMeta};

    use super::*;
    use crate::resources::LocalObjectReference;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[tokio::test]
    async fn transforms_apply_in_order() {
        let secrets = MemoryStore::<Secret>::new();
        let mut extra = Secret {
            metadata: ObjectMeta::new("db", "extra"),
            ..Secret::default()
        };
        extra.data.insert("sslmode".to_owned(), b"require".to_vec());
        secrets.create(extra).await.unwrap();

        let transforms = vec![
            SecretTransform::RenameKey {
                from: "user".to_owned(),
                to: "username".to_owned(),
            },
            SecretTransform::AddKey {
                key: "password".to_owned(),
                value: "fallback".to_owned(),
            },
            SecretTransform::AddKeysFrom {
                secret_ref: LocalObjectReference::new("extra"),
            },
            SecretTransform::RemoveKey {
                key: "root_cert".to_owned(),
            },
        ];
        let mut d = data(&[("user", "admin"), ("root_cert", "---")]);
        apply_transforms(&secrets, "db", &transforms, &mut d).await.unwrap();

        assert_eq!(
            d,
            data(&[("password", "fallback"), ("sslmode", "require"), ("username", "admin")])
        );
    }

    #[tokio::test]
    async fn missing_source_secret_fails() {
        let secrets = MemoryStore::<Secret>::new();
        let transforms = vec![SecretTransform::AddKeysFrom {
            secret_ref: LocalObjectReference::new("gone"),
        }];
        let mut d = BTreeMap::new();
        let result = apply_transforms(&secrets, "db", &transforms, &mut d).await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }
}

//! Resolves `${NAME}` references embedded in backend configuration into
//! concrete secret values at connection time.

use std::collections::BTreeMap;

use crate::error::HubError;

/// Collaborator that resolves a named credential reference to its value.
/// The hub core never persists or stores credentials itself.
pub trait CredentialProvider: Send + Sync + 'static {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Resolves `${NAME}` by reading the process environment.
#[derive(Default)]
pub struct EnvCredentialProvider;

impl CredentialProvider for EnvCredentialProvider {
    fn resolve(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Resolves from a fixed in-memory map; used in tests and anywhere the
/// caller already has resolved secrets on hand.
#[derive(Default)]
pub struct StaticCredentialProvider {
    values: BTreeMap<String, String>,
}

impl StaticCredentialProvider {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn resolve(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Expand `${NAME}` occurrences in `value` using `provider`. A reference to
/// an unresolvable name is an error rather than being left verbatim, since a
/// backend silently launching with the literal `${TOKEN}` string is worse
/// than failing fast.
pub fn expand(value: &str, provider: &dyn CredentialProvider) -> Result<String, HubError> {
    if !value.contains("${") {
        return Ok(value.to_string());
    }

    let mut out = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = value[i + 2..].find('}') {
                let name = &value[i + 2..i + 2 + end];
                let resolved = provider
                    .resolve(name)
                    .ok_or_else(|| HubError::UnresolvedCredential(name.to_string()))?;
                out.push_str(&resolved);
                i += 2 + end + 1;
                continue;
            }
        }
        let ch = value[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_reference() {
        let mut values = BTreeMap::new();
        values.insert("TOKEN".to_string(), "secret".to_string());
        let provider = StaticCredentialProvider::new(values);
        assert_eq!(expand("Bearer ${TOKEN}", &provider).unwrap(), "Bearer secret");
    }

    #[test]
    fn errors_on_unknown_reference() {
        let provider = StaticCredentialProvider::default();
        assert!(expand("${MISSING}", &provider).is_err());
    }

    #[test]
    fn passes_through_plain_values() {
        let provider = StaticCredentialProvider::default();
        assert_eq!(expand("plain", &provider).unwrap(), "plain");
    }
}

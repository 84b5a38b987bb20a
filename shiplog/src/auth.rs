//! ACL authorization.
//!
//! The authorizer answers one question: may `subject` perform `action` on
//! `object`. Grants come from a policy table file of lines shaped like
//!
//! ```text
//! p, root, *, produce
//! p, root, *, consume
//! ```
//!
//! with `*` matching any object or action. The model file describes the
//! matching semantics for external tooling and is validated for existence
//! only; the matcher here is fixed to exact-or-wildcard.

use crate::error::{LogError, Result};
use std::fs;
use std::path::Path;

/// Subject assigned to peers that present no client certificate.
pub const ANONYMOUS: &str = "anonymous";

/// Matches any object or action in a policy rule.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone)]
struct Rule {
    subject: String,
    object: String,
    action: String,
}

/// Answers allow/deny for (subject, object, action) triples.
#[derive(Debug, Default)]
pub struct Authorizer {
    rules: Vec<Rule>,
    /// With no policy configured every call is allowed.
    permissive: bool,
}

impl Authorizer {
    /// Load the authorizer from its model and policy files. A missing
    /// policy yields a permissive authorizer.
    pub fn new(model_file: Option<&Path>, policy_file: Option<&Path>) -> Result<Self> {
        if let Some(model) = model_file {
            if !model.exists() {
                return Err(LogError::Config(format!(
                    "acl model file {} does not exist",
                    model.display()
                )));
            }
        }
        let policy_file = match policy_file {
            Some(path) => path,
            None => {
                return Ok(Self {
                    rules: Vec::new(),
                    permissive: true,
                })
            }
        };

        let mut rules = Vec::new();
        for (lineno, line) in fs::read_to_string(policy_file)?.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            match fields.as_slice() {
                ["p", subject, object, action] => rules.push(Rule {
                    subject: subject.to_string(),
                    object: object.to_string(),
                    action: action.to_string(),
                }),
                _ => {
                    return Err(LogError::Config(format!(
                        "{}:{}: malformed policy line",
                        policy_file.display(),
                        lineno + 1
                    )))
                }
            }
        }
        Ok(Self {
            rules,
            permissive: false,
        })
    }

    /// Check whether `subject` may perform `action` on `object`.
    pub fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<()> {
        if self.permissive {
            return Ok(());
        }
        let allowed = self.rules.iter().any(|rule| {
            rule.subject == subject
                && (rule.object == WILDCARD || rule.object == object)
                && (rule.action == WILDCARD || rule.action == action)
        });
        if allowed {
            Ok(())
        } else {
            Err(LogError::PermissionDenied {
                subject: subject.to_string(),
                object: object.to_string(),
                action: action.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn policy(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("create policy file");
        file.write_all(content.as_bytes()).expect("write policy");
        file
    }

    #[test]
    fn grants_match_exact_and_wildcard() {
        let file = policy("p, root, *, produce\np, root, *, consume\n");
        let auth = Authorizer::new(None, Some(file.path())).expect("load");

        assert!(auth.authorize("root", "*", "produce").is_ok());
        assert!(auth.authorize("root", "*", "consume").is_ok());
        assert!(auth.authorize("nobody", "*", "produce").is_err());
        assert!(auth.authorize("root", "*", "delete").is_err());
    }

    #[test]
    fn denial_carries_the_triple() {
        let file = policy("p, root, *, produce\n");
        let auth = Authorizer::new(None, Some(file.path())).expect("load");
        match auth.authorize("nobody", "*", "produce") {
            Err(LogError::PermissionDenied { subject, .. }) => assert_eq!(subject, "nobody"),
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[test]
    fn no_policy_is_permissive() {
        let auth = Authorizer::new(None, None).expect("load");
        assert!(auth.authorize(ANONYMOUS, "*", "produce").is_ok());
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let file = policy("p, too, few\n");
        assert!(Authorizer::new(None, Some(file.path())).is_err());
    }
}

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use url::Url;

use crate::error::{ConfigError, ConfigResult};

/// Where a sink writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEndpoint {
    /// Tabular rendering on stdout (observation sink).
    Console,
    /// Rows appended to a Postgres table (durable sink).
    Postgres { url: String },
    /// JSON lines appended to a file (durable sink).
    File { path: PathBuf },
}

impl SinkEndpoint {
    /// Parse an endpoint string: `console`/`stdout`, `postgres://...`,
    /// `postgresql://...` or `file://<path>`.
    pub fn parse(endpoint: &str) -> ConfigResult<Self> {
        let endpoint = endpoint.trim();
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        };

        if endpoint.is_empty() {
            return Err(invalid("empty endpoint (unset environment variable?)"));
        }
        if endpoint.eq_ignore_ascii_case("console") || endpoint.eq_ignore_ascii_case("stdout") {
            return Ok(SinkEndpoint::Console);
        }
        // file:// paths are usually relative, which a URL cannot represent
        if let Some(path) = endpoint.strip_prefix("file://") {
            if path.is_empty() {
                return Err(invalid("missing file path"));
            }
            return Ok(SinkEndpoint::File {
                path: PathBuf::from(path),
            });
        }

        let url = Url::parse(endpoint).map_err(|e| invalid(&e.to_string()))?;
        match url.scheme() {
            "postgres" | "postgresql" => {
                if url.host_str().map_or(true, str::is_empty) {
                    return Err(invalid("missing host"));
                }
                Ok(SinkEndpoint::Postgres {
                    url: endpoint.to_string(),
                })
            }
            other => Err(invalid(&format!("unsupported scheme '{}'", other))),
        }
    }

    /// Name used when the configuration does not give one.
    pub fn default_name(&self) -> &'static str {
        match self {
            SinkEndpoint::Console => "console",
            SinkEndpoint::Postgres { .. } => "postgres",
            SinkEndpoint::File { .. } => "file",
        }
    }

    pub fn is_durable(&self) -> bool {
        !matches!(self, SinkEndpoint::Console)
    }
}

impl fmt::Display for SinkEndpoint {
    /// Credentials are never printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkEndpoint::Console => write!(f, "console"),
            SinkEndpoint::File { path } => write!(f, "file://{}", path.display()),
            SinkEndpoint::Postgres { url } => match Url::parse(url) {
                Ok(mut parsed) => {
                    if parsed.password().is_some() {
                        let _ = parsed.set_password(Some("****"));
                    }
                    write!(f, "{}", parsed)
                }
                Err(_) => write!(f, "postgres://****"),
            },
        }
    }
}

/// A named, parsed sink endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSpec {
    pub name: String,
    pub endpoint: SinkEndpoint,
}

/// Assign names to endpoints. Explicit names must be unique; derived names
/// get a numeric suffix when the same kind appears more than once.
pub(crate) fn name_sinks(
    entries: Vec<(Option<String>, SinkEndpoint)>,
) -> ConfigResult<Vec<SinkSpec>> {
    let mut specs: Vec<SinkSpec> = Vec::with_capacity(entries.len());
    let mut derived: HashMap<&'static str, usize> = HashMap::new();

    // Explicit names first so derived ones can step around them.
    let explicit: Vec<String> = entries.iter().filter_map(|(n, _)| n.clone()).collect();

    for (name, endpoint) in entries {
        let name = match name {
            Some(name) => {
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(ConfigError::InvalidEndpoint {
                        endpoint: endpoint.to_string(),
                        reason: "sink name must not be empty".to_string(),
                    });
                }
                name
            }
            None => {
                let base = endpoint.default_name();
                loop {
                    let n = derived.entry(base).or_insert(0);
                    *n += 1;
                    let candidate = if *n == 1 {
                        base.to_string()
                    } else {
                        format!("{}-{}", base, n)
                    };
                    if !explicit.contains(&candidate) {
                        break candidate;
                    }
                }
            }
        };

        if specs.iter().any(|s| s.name == name) {
            return Err(ConfigError::DuplicateSinkName(name));
        }
        specs.push(SinkSpec { name, endpoint });
    }

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(SinkEndpoint::parse("console").unwrap(), SinkEndpoint::Console);
        assert_eq!(SinkEndpoint::parse(" STDOUT ").unwrap(), SinkEndpoint::Console);
        assert_eq!(
            SinkEndpoint::parse("file://./out/changes.jsonl").unwrap(),
            SinkEndpoint::File {
                path: PathBuf::from("./out/changes.jsonl")
            }
        );
        assert_eq!(
            SinkEndpoint::parse("postgresql://u:p@localhost:5432/parking").unwrap(),
            SinkEndpoint::Postgres {
                url: "postgresql://u:p@localhost:5432/parking".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_endpoints() {
        for bad in ["", "   ", "file://", "http://example.com", "not a url", "postgres:///db"] {
            assert!(
                matches!(SinkEndpoint::parse(bad), Err(ConfigError::InvalidEndpoint { .. })),
                "expected {:?} to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_display_hides_password() {
        let endpoint = SinkEndpoint::parse("postgres://app:secret@db:5432/parking").unwrap();
        let shown = endpoint.to_string();
        assert!(!shown.contains("secret"));
        assert!(shown.contains("app:****@db"));
    }

    #[test]
    fn test_derived_names_are_suffixed() {
        let specs = name_sinks(vec![
            (None, SinkEndpoint::Console),
            (None, SinkEndpoint::File { path: "a.jsonl".into() }),
            (None, SinkEndpoint::File { path: "b.jsonl".into() }),
        ])
        .unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["console", "file", "file-2"]);
    }

    #[test]
    fn test_derived_names_avoid_explicit_ones() {
        let specs = name_sinks(vec![
            (None, SinkEndpoint::File { path: "a.jsonl".into() }),
            (Some("file".into()), SinkEndpoint::File { path: "b.jsonl".into() }),
        ])
        .unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["file-2", "file"]);
    }

    #[test]
    fn test_duplicate_explicit_names() {
        let result = name_sinks(vec![
            (Some("out".into()), SinkEndpoint::Console),
            (Some("out".into()), SinkEndpoint::File { path: "a".into() }),
        ]);
        assert!(matches!(result, Err(ConfigError::DuplicateSinkName(n)) if n == "out"));
    }
}

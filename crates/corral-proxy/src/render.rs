//! Proxy config rendering and validation.
//!
//! The output is HAProxy-style text: one `frontend`/`backend` pair per
//! routed role. `render` is pure, so equal tables give byte-identical
//! documents and equal digests.

use std::collections::BTreeSet;
use std::fmt::Write;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RoutingError, RoutingResult};
use crate::table::RoutingTable;

/// A rendered config and the sha256 of its text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub text: String,
    pub digest: String,
}

impl ConfigDocument {
    pub fn new(text: String) -> Self {
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        Self { text, digest }
    }
}

pub fn render(table: &RoutingTable) -> ConfigDocument {
    let mut out = String::new();
    out.push_str("# generated by corral; do not edit\n");
    out.push_str("global\n    maxconn 4096\n\n");
    out.push_str("defaults\n");
    out.push_str("    timeout connect 5s\n");
    out.push_str("    timeout client 30s\n");
    out.push_str("    timeout server 30s\n");

    for route in &table.routes {
        let name = route.role.as_str();
        let mode = route.mode.as_str();
        // Writing into a String cannot fail.
        let _ = write!(
            out,
            "\nfrontend {name}\n    bind *:{}\n    mode {mode}\n    default_backend {name}\n",
            route.listen_port
        );
        let _ = write!(out, "\nbackend {name}\n    mode {mode}\n    balance roundrobin\n");
        for backend in &route.backends {
            let _ = writeln!(
                out,
                "    server {} {} check",
                backend.member,
                backend.endpoint()
            );
        }
    }
    ConfigDocument::new(out)
}

/// Parse a document back and reject anything malformed.
///
/// Checks the digest, the section structure, bind ports, server
/// endpoints, and that every frontend points at a defined backend.
pub fn validate(doc: &ConfigDocument) -> RoutingResult<()> {
    let fail = |line: usize, msg: &str| RoutingError::Validation(format!("line {line}: {msg}"));

    if ConfigDocument::new(doc.text.clone()).digest != doc.digest {
        return Err(RoutingError::Validation("digest does not match text".into()));
    }

    let mut section: Option<(&str, &str)> = None;
    let mut frontends: Vec<(usize, &str, Option<&str>)> = Vec::new();
    let mut backends = BTreeSet::new();

    for (idx, line) in doc.text.lines().enumerate() {
        let n = idx + 1;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        if !line.starts_with(' ') {
            let mut words = line.split_whitespace();
            let kind = words.next().unwrap_or_default();
            let name = words.next();
            section = match (kind, name, words.next()) {
                ("global" | "defaults", None, _) => Some((kind, "")),
                ("frontend", Some(name), None) => {
                    frontends.push((n, name, None));
                    Some((kind, name))
                }
                ("backend", Some(name), None) => {
                    if !backends.insert(name) {
                        return Err(fail(n, &format!("backend {name} defined twice")));
                    }
                    Some((kind, name))
                }
                _ => return Err(fail(n, &format!("unknown section header {line:?}"))),
            };
            continue;
        }

        let Some((kind, _)) = section else {
            return Err(fail(n, "directive outside of any section"));
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        match (kind, words.as_slice()) {
            ("frontend", ["bind", addr]) => {
                let port = addr.rsplit_once(':').map(|(_, p)| p).unwrap_or_default();
                if port.parse::<u16>().map_or(true, |p| p == 0) {
                    return Err(fail(n, &format!("invalid bind address {addr}")));
                }
            }
            ("frontend", ["default_backend", target]) => {
                if let Some(last) = frontends.last_mut() {
                    last.2 = Some(*target);
                }
            }
            ("frontend" | "backend", ["mode", mode]) => {
                if !matches!(*mode, "http" | "tcp") {
                    return Err(fail(n, &format!("unknown mode {mode}")));
                }
            }
            ("backend", ["server", _name, endpoint, rest @ ..]) => {
                let valid = endpoint
                    .rsplit_once(':')
                    .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
                if !valid || rest.iter().any(|w| *w != "check") {
                    return Err(fail(n, &format!("invalid server line {:?}", line.trim())));
                }
            }
            ("backend", ["balance", _]) | ("global", ["maxconn", _]) => {}
            ("defaults", ["timeout", _, _]) => {}
            _ => return Err(fail(n, &format!("unexpected directive {:?}", line.trim()))),
        }
    }

    for (n, name, target) in frontends {
        match target {
            Some(target) if backends.contains(target) => {}
            Some(target) => return Err(fail(n, &format!("frontend {name} uses undefined backend {target}"))),
            None => return Err(fail(n, &format!("frontend {name} has no default_backend"))),
        }
    }
    Ok(())
}

//! resolv.conf parsing

use std::net::IpAddr;
use std::path::Path;

use crate::error::Result;

/// DNS data found in a resolv.conf file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    pub nameservers: Vec<IpAddr>,
    pub searches: Vec<String>,
    pub options: Vec<String>,
}

/// Parse resolv.conf contents
///
/// Unknown keywords and malformed nameserver lines are skipped. As with the
/// system resolver, the last `search` line wins.
pub fn parse_resolv_conf(contents: &str) -> ResolvConf {
    let mut conf = ResolvConf::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("nameserver") => {
                // drop a scope suffix such as fe80::1%eth0
                let parsed = fields
                    .next()
                    .and_then(|v| v.split('%').next())
                    .and_then(|v| v.parse::<IpAddr>().ok());
                if let Some(ns) = parsed {
                    if !conf.nameservers.contains(&ns) {
                        conf.nameservers.push(ns);
                    }
                }
            }
            Some("search") => {
                conf.searches = fields.map(str::to_string).collect();
            }
            Some("options") => {
                for option in fields {
                    if !conf.options.iter().any(|o| o == option) {
                        conf.options.push(option.to_string());
                    }
                }
            }
            _ => {}
        }
    }
    conf
}

/// Read and parse a resolv.conf file
pub async fn read_resolv_conf(path: impl AsRef<Path>) -> Result<ResolvConf> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(parse_resolv_conf(&contents))
}

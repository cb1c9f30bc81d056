use anyhow::{bail, Result};
use regex::Regex;
use serde_json::{json, Value};

use crate::types::Host;

/// Render `{{ dotted.path }}` placeholders in a probe config field against
/// the host context. An unresolvable placeholder is an error; the caller
/// skips generating that probe for the host.
pub fn render(input: &str, context: &Value) -> Result<String> {
    // Placeholders are rare enough that compiling here is fine; probes are
    // regenerated per host per tick anyway.
    let re = Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}")?;

    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        let path = &caps[1];
        out.push_str(&input[last..whole.0]);
        out.push_str(&lookup(context, path)?);
        last = whole.1;
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// Template context for one host:
///
/// ```text
/// host.id, host.name, host.custom_identifier,
/// host.ip_addresses.<interface-name>, host.roles, host.meta.<...>
/// ```
pub fn host_context(host: &Host) -> Value {
    let ip_addresses: serde_json::Map<String, Value> = host
        .interfaces
        .iter()
        .filter_map(|i| {
            i.primary_address()
                .map(|addr| (i.name.clone(), Value::String(addr.to_string())))
        })
        .collect();

    // service:role pairs, the flattened view probes and commands consume
    let mut roles: Vec<String> = host
        .roles
        .iter()
        .flat_map(|(service, names)| {
            names.iter().map(move |r| format!("{}:{}", service, r))
        })
        .collect();
    roles.sort();

    json!({
        "host": {
            "id": host.id,
            "name": host.name,
            "custom_identifier": host.custom_identifier,
            "ip_addresses": ip_addresses,
            "roles": roles,
            "meta": host.meta,
        }
    })
}

fn lookup(context: &Value, path: &str) -> Result<String> {
    let mut current = context;
    for key in path.split('.') {
        match current.get(key) {
            Some(v) => current = v,
            None => bail!("template path {} is not defined for this host", path),
        }
    }
    match current {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => bail!("template path {} is null for this host", path),
        other => Ok(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Interface;

    fn host() -> Host {
        Host {
            id: "h1".into(),
            name: "web01".into(),
            custom_identifier: Some("web01.example.com".into()),
            interfaces: vec![Interface {
                name: "eth0".into(),
                ip_address: Some("10.0.0.5".into()),
                ..Default::default()
            }],
            roles: [("web".to_string(), vec!["app".to_string()])]
                .into_iter()
                .collect(),
            meta: serde_json::json!({"agent-version": "7.0.0"}),
        }
    }

    #[test]
    fn renders_host_fields() {
        let ctx = host_context(&host());
        assert_eq!(render("{{ host.name }}", &ctx).unwrap(), "web01");
        assert_eq!(
            render("ping -c1 {{ host.ip_addresses.eth0 }}", &ctx).unwrap(),
            "ping -c1 10.0.0.5"
        );
        assert_eq!(
            render("{{ host.meta.agent-version }}", &ctx).unwrap(),
            "7.0.0"
        );
    }

    #[test]
    fn renders_multiple_placeholders() {
        let ctx = host_context(&host());
        assert_eq!(
            render("{{ host.id }}/{{ host.name }}", &ctx).unwrap(),
            "h1/web01"
        );
    }

    #[test]
    fn passes_through_plain_strings() {
        let ctx = host_context(&host());
        assert_eq!(render("no placeholders", &ctx).unwrap(), "no placeholders");
    }

    #[test]
    fn unresolved_path_is_an_error() {
        let ctx = host_context(&host());
        assert!(render("{{ host.ip_addresses.eth9 }}", &ctx).is_err());
        assert!(render("{{ nonsense }}", &ctx).is_err());
    }
}

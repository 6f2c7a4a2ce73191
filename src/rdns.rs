/// Reverse-DNS pointer rendering
use anyhow::{Context, Result};
use serde::Serialize;

/// Variables available to reverse-DNS templates.
#[derive(Debug, Clone, Serialize)]
pub struct RdnsVars {
    /// Cluster name
    pub cluster: String,
    /// Resource name (server or load balancer)
    pub name: String,
    /// IP address with separators replaced by dashes
    pub ip_dashed: String,
}

impl RdnsVars {
    pub fn new(cluster: &str, name: &str, ip: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            name: name.to_string(),
            ip_dashed: ip.replace(['.', ':'], "-"),
        }
    }
}

/// Render a reverse-DNS template. Pure: identical variables always yield
/// identical output.
pub fn render(template: &str, vars: &RdnsVars) -> Result<String> {
    let mut registry = handlebars::Handlebars::new();
    registry.set_strict_mode(true);
    registry
        .render_template(template, vars)
        .context("failed to render reverse-DNS template")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_vars() {
        let vars = RdnsVars::new("c1", "c1-cp-1", "192.0.2.10");
        let out = render("{{name}}.{{cluster}}.example.com", &vars).unwrap();
        assert_eq!(out, "c1-cp-1.c1.example.com");
    }

    #[test]
    fn test_render_ip_dashed() {
        let vars = RdnsVars::new("c1", "lb", "10.0.63.254");
        let out = render("{{ip_dashed}}.nodes.example.com", &vars).unwrap();
        assert_eq!(out, "10-0-63-254.nodes.example.com");
    }

    #[test]
    fn test_render_is_pure() {
        let vars = RdnsVars::new("c1", "w1", "10.0.128.3");
        let a = render("{{name}}-{{ip_dashed}}", &vars).unwrap();
        let b = render("{{name}}-{{ip_dashed}}", &vars).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_render_unknown_var_fails() {
        let vars = RdnsVars::new("c1", "w1", "10.0.128.3");
        assert!(render("{{bogus}}", &vars).is_err());
    }
}

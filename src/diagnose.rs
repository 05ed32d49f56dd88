//! `ztmesh tunnel diagnose`

use std::fmt;
use std::time::Instant;
use tracing::debug;

use crate::context::CommandContext;

#[derive(Debug)]
pub struct Check {
    pub name: &'static str,
    pub outcome: Result<String, String>,
}

impl Check {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            outcome: Ok(detail.into()),
        }
    }

    fn fail(name: &'static str, detail: impl fmt::Display) -> Self {
        Self {
            name,
            outcome: Err(detail.to_string()),
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome.is_ok()
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Ok(detail) => write!(f, "✅ {:<16} {}", self.name, detail),
            Err(detail) => write!(f, "❌ {:<16} {}", self.name, detail),
        }
    }
}

/// Run every check in order. Later checks are skipped once configuration is
/// unusable.
pub async fn run_checks(ctx: &CommandContext) -> Vec<Check> {
    let mut checks = Vec::new();

    let api = match ctx.api_client() {
        Ok(api) => {
            checks.push(Check::pass(
                "config",
                format!("api {} (device {})", ctx.config.api_url(), ctx.device.device_id),
            ));
            api
        }
        Err(e) => {
            checks.push(Check::fail("config", format!("{:#}", e)));
            return checks;
        }
    };

    let started = Instant::now();
    checks.push(match api.list_mesh_nodes().await {
        Ok(nodes) => Check::pass(
            "api",
            format!("{} mesh nodes ({} ms)", nodes.len(), started.elapsed().as_millis()),
        ),
        Err(e) => Check::fail("api", e),
    });

    checks.push(match api.relay_token(&ctx.device.device_id).await {
        Ok(token) if !token.token.is_empty() => Check::pass("relay token", "issued"),
        Ok(_) => Check::fail("relay token", "backend returned an empty token"),
        Err(e) => Check::fail("relay token", e),
    });

    let tunnel_ctx = match ctx.tunnel_context() {
        Ok(tunnel_ctx) => tunnel_ctx,
        Err(e) => {
            checks.push(Check::fail("relay session", format!("{:#}", e)));
            return checks;
        }
    };
    let started = Instant::now();
    checks.push(match tunnel_ctx.open_session().await {
        Ok(session) => {
            let detail = format!(
                "registered at {} as {} ({} ms)",
                tunnel_ctx.relay_url,
                session.relay_session_id(),
                started.elapsed().as_millis()
            );
            if let Err(e) = session.close().await {
                debug!("Error closing diagnostic session: {}", e);
            }
            Check::pass("relay session", detail)
        }
        Err(e) => Check::fail("relay session", format!("{} ({})", e, e.kind())),
    });

    checks
}

//! HTML error pages rendered by the proxy.
//!
//! These are the only user-visible surface when routing fails, so they
//! get a minimal inline style instead of a bare status line.

fn page(title: &str, heading: &str, detail: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
<style>
  body {{ font-family: -apple-system, "Segoe UI", Roboto, sans-serif; background: #f6f7f9; color: #1f2328; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; }}
  .card {{ background: #fff; border: 1px solid #d9dee3; border-radius: 8px; padding: 40px 48px; max-width: 460px; text-align: center; }}
  h1 {{ font-size: 22px; margin: 0 0 12px; }}
  p {{ margin: 0; color: #57606a; line-height: 1.5; }}
  .brand {{ margin-top: 24px; font-size: 12px; color: #8b949e; }}
</style>
</head>
<body>
<div class="card">
<h1>{heading}</h1>
<p>{detail}</p>
<div class="brand">hoster</div>
</div>
</body>
</html>
"#
    )
}

/// 404: no deployment matches the hostname.
pub fn not_found(host: &str) -> String {
    page(
        "App Not Found",
        "App Not Found",
        &format!("No application is published at <strong>{}</strong>.", escape(host)),
    )
}

/// 503: the deployment exists but is not running.
pub fn stopped(host: &str) -> String {
    page(
        "App Stopped",
        "App Stopped",
        &format!(
            "The application at <strong>{}</strong> is currently stopped. Start it from your dashboard.",
            escape(host)
        ),
    )
}

/// 503: custom domain awaiting DNS verification.
pub fn verification_pending(host: &str) -> String {
    page(
        "Verification Pending",
        "Verification Pending",
        &format!(
            "The domain <strong>{}</strong> has not finished DNS verification yet. This usually completes within a few minutes of updating your DNS records.",
            escape(host)
        ),
    )
}

/// 503: upstream transport failure.
pub fn unavailable(host: &str) -> String {
    page(
        "Unavailable",
        "Temporarily Unavailable",
        &format!(
            "The application at <strong>{}</strong> did not respond. Please try again shortly.",
            escape(host)
        ),
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_carry_their_heading() {
        assert!(not_found("x.apps.localhost").contains("App Not Found"));
        assert!(stopped("x.apps.localhost").contains("App Stopped"));
        assert!(verification_pending("shop.example.com").contains("Verification Pending"));
        assert!(unavailable("x.apps.localhost").contains("Temporarily Unavailable"));
    }

    #[test]
    fn hostnames_are_escaped() {
        let html = not_found("<script>alert(1)</script>");
        assert!(!html.contains("<script>alert"));
        assert!(html.contains("&lt;script&gt;"));
    }
}

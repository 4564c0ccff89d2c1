//! Shared fixtures: a mock instance with a form-login identity flow.

#![allow(dead_code)]

use serde_json::{json, Value};
use ticketline_domain::{
    AuthConfig, BreakerSettings, CursorSettings, InstanceConfig, RateLimitSettings,
    TicketlineConfig,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SESSION_ID: &str = "S1";
pub const TOKEN: &str = "tok-42";
/// Cookie header of the signed-in session: route cookie, then session cookie
pub const COOKIE_HEADER: &str = "glide_user_route=r1; JSESSIONID=S1";

const LOGIN_FORM: &str = r#"
    <html><body>
      <form method="post" action="/login.do">
        <input type="hidden" name="sysparm_ck" value="abc123">
        <input type="text" name="user_name">
        <input type="password" name="user_password">
      </form>
    </body></html>"#;

/// Mount the sign-in chain; the credential POST must happen `logins` times.
pub async fn mount_login(server: &MockServer, logins: u64) {
    Mock::given(method("GET"))
        .and(path("/login_redirect.do"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "/login.do")
                .insert_header("Set-Cookie", "glide_user_route=r1; Path=/"),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/login.do"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_FORM))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login.do"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "/navpage.do")
                .insert_header("Set-Cookie", format!("JSESSIONID={SESSION_ID}; Path=/; HttpOnly")),
        )
        .expect(logins)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/navpage.do"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!("<script>var g_ck = '{TOKEN}';</script>")),
        )
        .mount(server)
        .await;
}

/// Configuration pointing every endpoint at `server`, with millisecond backoff.
pub fn config_for(server: &MockServer) -> TicketlineConfig {
    TicketlineConfig {
        instance: InstanceConfig {
            base_url: server.uri(),
            request_timeout_secs: 5,
            ..InstanceConfig::default()
        },
        auth: AuthConfig {
            login_url: Some(format!("{}/login_redirect.do", server.uri())),
            username: Some("svc.integration".into()),
            password: Some("secret".into()),
            ..AuthConfig::default()
        },
        rate_limit: RateLimitSettings {
            requests_per_second: 100,
            backoff_unit_ms: 1,
            backoff_cap_ms: 20,
            backoff_floor_ms: 1,
            poll_interval_ms: 5,
            ..RateLimitSettings::default()
        },
        circuit_breaker: BreakerSettings::default(),
        cursor: CursorSettings { batch_size: 2, prefetch_threshold: 1, max_cache_size: 10 },
        ..TicketlineConfig::default()
    }
}

/// Incident row in `sysparm_display_value=all` shape.
pub fn incident(sys_id: &str, number: &str, priority: u8) -> Value {
    let label = match priority {
        1 => "1 - Critical",
        2 => "2 - High",
        _ => "3 - Moderate",
    };
    json!({
        "sys_id": { "value": sys_id, "display_value": sys_id },
        "number": { "value": number, "display_value": number },
        "priority": { "value": priority.to_string(), "display_value": label },
    })
}

pub fn page(rows: Vec<Value>, total: usize) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("X-Total-Count", total.to_string().as_str())
        .set_body_json(json!({ "result": rows }))
}

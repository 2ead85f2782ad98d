use std::net::SocketAddr;

use axum::{
    body::{Body, to_bytes},
    extract::{ConnectInfo, State},
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    AppState,
    admission::{IdentityContext, IdentitySignals, Screening, TokenUsage},
    config::Config,
    error::GateError,
    utils::{cookie_value, session_digest, verify_token},
};

fn header_str<'a>(req: &'a Request<Body>, name: header::HeaderName) -> Option<&'a str> {
    req.headers().get(name).and_then(|h| h.to_str().ok())
}

/// 客户端地址：x-real-ip > x-forwarded-for 第一个非空值 > 连接地址
pub fn client_ip(req: &Request<Body>) -> String {
    let remote_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());

    req.headers()
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .filter(|ip| !ip.trim().is_empty())
        .or_else(|| {
            req.headers()
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').find(|ip| !ip.trim().is_empty()))
        })
        .or(remote_ip.as_deref())
        .unwrap_or("unknown")
        .trim()
        .to_string()
}

/// 提取身份信号，临时用户按匿名会话处理
pub fn identity_signals(req: &Request<Body>, config: &Config) -> IdentitySignals {
    let claims = header_str(req, header::AUTHORIZATION)
        .and_then(|h| h.strip_prefix("Bearer "))
        .and_then(|token| match verify_token(token.trim(), &config.jwt_secret) {
            Ok(claims) => Some(claims),
            Err(e) => {
                tracing::debug!("Ignoring invalid bearer token: {}", e);
                None
            }
        });

    let (user_id, temp_session) = match claims {
        Some(claims) if claims.is_temp => (None, Some(claims.sub)),
        Some(claims) => (Some(claims.sub), None),
        None => (None, None),
    };

    let session_id = temp_session
        .or_else(|| cookie_value(req.headers(), &config.session_cookie).map(session_digest));

    IdentitySignals {
        user_id,
        session_id,
        address: client_ip(req),
        user_agent: header_str(req, header::USER_AGENT).map(String::from),
    }
}

pub async fn admission_gate(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let gate = state.gate.clone();

    let content_length = header_str(&req, header::CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
    let screening = gate.screen(
        req.method(),
        req.uri().path(),
        header_str(&req, header::CONTENT_TYPE),
        content_length,
    );
    match screening {
        Screening::Skip => return next.run(req).await,
        Screening::Reject(e) => {
            tracing::debug!(path = %req.uri().path(), "Request rejected before admission: {}", e);
            return e.into_response();
        }
        Screening::Proceed => {}
    }

    // 未声明长度（如分块传输）时，在有状态检查之前读取并限制请求体
    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, gate.settings().max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("Failed to buffer request body: {}", e);
            return GateError::PayloadTooLarge.into_response();
        }
    };
    let mut req = Request::from_parts(parts, Body::from(bytes));

    let identity = IdentityContext::new(identity_signals(&req, &state.config));
    let outcome = gate.admit(identity).await;
    tracing::debug!(state = outcome.state(), path = %req.uri().path(), "Admission finished");

    let context = match outcome.into_result() {
        Ok(context) => context,
        Err(e) => return e.into_response(),
    };

    req.extensions_mut().insert(context.clone());
    let response = next.run(req).await;

    let usage = response
        .extensions()
        .get::<TokenUsage>()
        .copied()
        .unwrap_or_default();
    gate.complete(context, usage, response.status()).await;

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_token;

    fn config() -> Config {
        Config {
            jwt_secret: "test-secret".into(),
            ..Config::default()
        }
    }

    fn request(headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri("/api/v1/chat/completions");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn client_ip_prefers_real_ip_then_forwarded() {
        let req = request(&[("x-real-ip", "1.1.1.1"), ("x-forwarded-for", "2.2.2.2")]);
        assert_eq!(client_ip(&req), "1.1.1.1");

        let req = request(&[("x-forwarded-for", " , 3.3.3.3, 4.4.4.4")]);
        assert_eq!(client_ip(&req), "3.3.3.3");

        let mut req = request(&[]);
        req.extensions_mut()
            .insert(ConnectInfo("10.9.8.7:4000".parse::<SocketAddr>().unwrap()));
        assert_eq!(client_ip(&req), "10.9.8.7");

        assert_eq!(client_ip(&request(&[])), "unknown");
    }

    #[test]
    fn registered_token_resolves_to_user() {
        let token = generate_token("alice", false, 600, "test-secret").unwrap();
        let auth = format!("Bearer {token}");
        let req = request(&[("authorization", auth.as_str()), ("cookie", "sessionid=s1")]);

        let ctx = IdentityContext::new(identity_signals(&req, &config()));
        assert_eq!(ctx.identifier.to_string(), "user:alice");
    }

    #[test]
    fn temporary_token_counts_as_session() {
        let token = generate_token("tmp-1", true, 600, "test-secret").unwrap();
        let auth = format!("Bearer {token}");
        let req = request(&[("authorization", auth.as_str())]);

        let ctx = IdentityContext::new(identity_signals(&req, &config()));
        assert_eq!(ctx.identifier.to_string(), "session:tmp-1");
    }

    #[test]
    fn invalid_token_falls_back_to_cookie_session() {
        let req = request(&[
            ("authorization", "Bearer not-a-jwt"),
            ("cookie", "sessionid=raw-cookie"),
            ("x-real-ip", "5.5.5.5"),
        ]);
        let ctx = IdentityContext::new(identity_signals(&req, &config()));
        assert_eq!(
            ctx.identifier.to_string(),
            format!("session:{}", session_digest("raw-cookie"))
        );
    }

    #[test]
    fn anonymous_request_uses_address() {
        let req = request(&[("x-real-ip", "5.5.5.5"), ("user-agent", "pytest")]);
        let signals = identity_signals(&req, &config());
        assert_eq!(signals.user_agent.as_deref(), Some("pytest"));
        assert_eq!(
            IdentityContext::new(signals).identifier.to_string(),
            "address:5.5.5.5"
        );
    }
}

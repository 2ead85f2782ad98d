pub mod ops;
pub mod proxy;

use axum::{
    Router,
    routing::{any, get},
};

use crate::{
    AppState,
    middleware::{admission_gate, log_errors},
};

/// 创建主路由；运维接口只在配置了 OPS_TOKEN 时挂载
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new().route("/api/v1/{*path}", any(proxy::forward));

    if state.config.ops_token.is_some() {
        router = router
            .route("/ops/load", get(ops::get_load).put(ops::update_load))
            .route("/ops/usage", get(ops::usage));
    }

    // 准入中间件在最外层，先于其他处理执行
    router
        .layer(axum::middleware::from_fn(log_errors))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admission_gate,
        ))
        .with_state(state)
}

use std::sync::Arc;

use admission::AdmissionGate;
use config::Config;

pub mod admission;
pub mod cache;
pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod utils;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub gate: Arc<AdmissionGate>,
    /// 转发到上游 AI 服务使用的客户端
    pub http: reqwest::Client,
}

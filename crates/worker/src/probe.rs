use std::time::Duration;

use dispatch_core::models::CapabilityCheck;
use tokio::net::TcpStream;
use tracing::debug;

/// 检查单个能力条件：`host:port` 能否在超时内建立TCP连接
pub async fn probe_criteria(criteria: &str, timeout: Duration) -> bool {
    let Some((host, port)) = criteria.rsplit_once(':') else {
        debug!("能力条件格式无效: {}", criteria);
        return false;
    };
    if host.is_empty() || port.parse::<u16>().is_err() {
        debug!("能力条件格式无效: {}", criteria);
        return false;
    }

    match tokio::time::timeout(timeout, TcpStream::connect(criteria)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("连接 {} 失败: {}", criteria, e);
            false
        }
        Err(_) => {
            debug!("连接 {} 超时", criteria);
            false
        }
    }
}

/// 并发验证全部条件
pub async fn validate_all(criteria: &[String], timeout: Duration) -> Vec<CapabilityCheck> {
    let checks = criteria.iter().map(|c| async move {
        CapabilityCheck {
            criteria: c.clone(),
            validated: probe_criteria(c, timeout).await,
        }
    });
    futures::future::join_all(checks).await
}

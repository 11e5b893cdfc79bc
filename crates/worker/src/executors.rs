use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dispatch_core::models::{ResponseCode, Task};
use dispatch_core::{DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{error, info};

use crate::client::TaskResultBody;

/// 一次执行的结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
}

impl ExecutionOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error_message: Some(message.into()),
            exit_code: None,
            execution_time_ms: 0,
        }
    }

    pub fn into_result_body(self) -> TaskResultBody {
        let response_code = if self.success {
            ResponseCode::Ok
        } else {
            ResponseCode::Failed
        };
        let error_message = self.error_message.clone();
        TaskResultBody {
            response_code,
            response: serde_json::to_value(&self).unwrap_or(serde_json::Value::Null),
            error_message: if self.success { None } else { error_message },
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn task_type(&self) -> &str;

    async fn execute(&self, task: &Task) -> DispatchResult<ExecutionOutcome>;
}

/// Shell任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    /// 要执行的命令；未给出args时交给 `sh -c` 解释
    pub command: String,
    pub args: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub env_vars: Option<HashMap<String, String>>,
}

/// Shell任务执行器
#[derive(Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    fn task_type(&self) -> &str {
        "shell"
    }

    async fn execute(&self, task: &Task) -> DispatchResult<ExecutionOutcome> {
        let start_time = Instant::now();
        let params: ShellTaskParams = serde_json::from_value(task.data.parameters.clone())
            .map_err(|e| DispatchError::validation_error(format!("解析Shell任务参数失败: {e}")))?;

        info!("执行Shell任务: task_id={}, command={}", task.id, params.command);

        let mut cmd = match params.args {
            Some(args) => {
                let mut cmd = Command::new(&params.command);
                cmd.args(args);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&params.command);
                cmd
            }
        };
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in params.env_vars.unwrap_or_default() {
            cmd.env(key, value);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| DispatchError::Internal(format!("启动Shell命令失败: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let success = output.status.success();
        let exit_code = output.status.code();

        let error_message = if !stderr.is_empty() {
            Some(stderr)
        } else if !success {
            Some(format!("命令执行失败，退出码: {exit_code:?}"))
        } else {
            None
        };

        let outcome = ExecutionOutcome {
            success,
            output: (!stdout.is_empty()).then_some(stdout),
            error_message,
            exit_code,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
        };
        info!(
            "Shell任务执行完成: task_id={}, success={}, exit_code={:?}, duration={}ms",
            task.id, success, exit_code, outcome.execution_time_ms
        );
        Ok(outcome)
    }
}

/// HTTP任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskParams {
    pub url: String,
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<String>,
}

/// HTTP任务执行器
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    fn task_type(&self) -> &str {
        "http"
    }

    async fn execute(&self, task: &Task) -> DispatchResult<ExecutionOutcome> {
        let start_time = Instant::now();
        let params: HttpTaskParams = serde_json::from_value(task.data.parameters.clone())
            .map_err(|e| DispatchError::validation_error(format!("解析HTTP任务参数失败: {e}")))?;

        let method = params.method.unwrap_or_else(|| "GET".to_string());
        info!("执行HTTP任务: task_id={}, method={}, url={}", task.id, method, params.url);

        let mut request = match method.to_uppercase().as_str() {
            "GET" => self.client.get(&params.url),
            "POST" => self.client.post(&params.url),
            "PUT" => self.client.put(&params.url),
            "DELETE" => self.client.delete(&params.url),
            "PATCH" => self.client.patch(&params.url),
            "HEAD" => self.client.head(&params.url),
            _ => {
                return Err(DispatchError::validation_error(format!(
                    "不支持的HTTP方法: {method}"
                )));
            }
        };
        request = request.timeout(Duration::from_millis(task.data.timeout_ms.max(1) as u64));
        for (key, value) in params.headers.unwrap_or_default() {
            request = request.header(&key, &value);
        }
        if let Some(body) = params.body {
            request = request.body(body);
        }

        let outcome = match request.send().await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                let success = response.status().is_success();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("读取响应体失败: {e}"));
                ExecutionOutcome {
                    success,
                    output: Some(body),
                    error_message: (!success)
                        .then(|| format!("HTTP请求失败，状态码: {status_code}")),
                    exit_code: Some(status_code as i32),
                    execution_time_ms: start_time.elapsed().as_millis() as u64,
                }
            }
            Err(e) => {
                error!("HTTP任务执行失败: task_id={}, error={}", task.id, e);
                ExecutionOutcome {
                    execution_time_ms: start_time.elapsed().as_millis() as u64,
                    ..ExecutionOutcome::failure(format!("HTTP请求失败: {e}"))
                }
            }
        };
        Ok(outcome)
    }
}

/// 按任务类型索引的执行器集合
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置的任务类型装配内置执行器，未知类型返回错误
    pub fn with_builtin(task_types: &[String]) -> DispatchResult<Self> {
        let mut registry = Self::new();
        for task_type in task_types {
            let executor: Arc<dyn TaskExecutor> = match task_type.as_str() {
                "shell" => Arc::new(ShellExecutor::new()),
                "http" => Arc::new(HttpExecutor::new()),
                other => {
                    return Err(DispatchError::config_error(format!(
                        "未知的执行器类型: {other}"
                    )))
                }
            };
            registry.register(executor);
        }
        Ok(registry)
    }

    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        self.executors
            .insert(executor.task_type().to_string(), executor);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(task_type).cloned()
    }

    pub fn supported_task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::models::TaskData;
    use serde_json::json;

    fn task(task_type: &str, parameters: serde_json::Value) -> Task {
        Task::new(
            "t",
            "default",
            TaskData {
                task_type: task_type.to_string(),
                parameters,
                timeout_ms: 10_000,
                is_async: false,
            },
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_command_line() {
        let outcome = ShellExecutor::new()
            .execute(&task("shell", json!({"command": "echo hello"})))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output.as_deref(), Some("hello"));
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_failure_reports_exit_code() {
        let outcome = ShellExecutor::new()
            .execute(&task("shell", json!({"command": "sh", "args": ["-c", "exit 3"]})))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));

        let body = outcome.into_result_body();
        assert_eq!(body.response_code, ResponseCode::Failed);
        assert!(body.error_message.is_some());
    }

    #[tokio::test]
    async fn test_shell_invalid_params() {
        let result = ShellExecutor::new()
            .execute(&task("shell", json!({"args": []})))
            .await;
        assert!(matches!(result, Err(DispatchError::ValidationError(_))));
    }

    #[test]
    fn test_registry_builtin_types() {
        let registry =
            ExecutorRegistry::with_builtin(&["shell".to_string(), "http".to_string()]).unwrap();
        assert_eq!(registry.supported_task_types(), vec!["http", "shell"]);
        assert!(registry.get("shell").is_some());
        assert!(registry.get("python").is_none());

        assert!(ExecutorRegistry::with_builtin(&["python".to_string()]).is_err());
    }
}

use thiserror::Error;

/**
 * \brief 模型服务层错误。
 * \details 只有 `UnknownProvider` 与 `MissingCredential` 会作为失败返回给调用方；
 *          远程调用类错误在分发器内部降级为本地分析。
 */
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AiError {
    /// 不在支持列表中的模型服务标识。
    #[error("不支持的模型服务: {0}")]
    UnknownProvider(String),

    /// 需要密钥的模型服务缺少密钥配置。
    #[error("模型服务 {provider} 缺少密钥配置 {env_key}")]
    MissingCredential { provider: String, env_key: String },

    /// 空消息或只包含空白的消息。
    #[error("消息内容不能为空")]
    EmptyUserMessage,

    /// 网络错误、非 2xx、响应格式错误或空回复。
    #[error("远程调用失败: {0}")]
    RemoteCallFailure(String),

    /// 远程调用超时。
    #[error("远程调用超时（{0} 秒）")]
    RemoteCallTimeout(u64),

    /// 客户端构建失败（非密钥原因）。
    #[error("客户端构建失败: {0}")]
    ClientBuild(String),
}

impl AiError {
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::RemoteCallFailure(msg.into())
    }

    /** \brief 面向调用方的稳定错误码。 */
    pub fn code(&self) -> &'static str {
        match self {
            AiError::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            AiError::MissingCredential { .. } => "MISSING_CREDENTIAL",
            AiError::EmptyUserMessage => "EMPTY_USER_MESSAGE",
            AiError::RemoteCallFailure(_) => "REMOTE_CALL_FAILURE",
            AiError::RemoteCallTimeout(_) => "REMOTE_CALL_TIMEOUT",
            AiError::ClientBuild(_) => "CLIENT_BUILD_FAILED",
        }
    }

    /** \brief 配置类错误需要向调用方报告，运行期错误则降级处理。 */
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            AiError::UnknownProvider(_) | AiError::MissingCredential { .. } | AiError::ClientBuild(_)
        )
    }
}

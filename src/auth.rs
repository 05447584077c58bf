// 身份模块 - 提供当前登录用户
//
// 登录流程本身由外部完成，这里只保存结果供会话收尾时读取

use crate::utils::validation::validate_email;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::info;

/// 当前用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub picture: String,
}

/// 身份提供者
pub trait IdentityProvider: Send + Sync {
    /// 当前用户，未登录时返回 None
    fn current_user(&self) -> Option<UserIdentity>;

    fn current_email(&self) -> Option<String> {
        self.current_user().map(|user| user.email)
    }
}

/// 可由登录流程更新的共享身份
#[derive(Default)]
pub struct SharedIdentity {
    user: RwLock<Option<UserIdentity>>,
}

impl SharedIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登录成功后写入用户
    pub fn sign_in(&self, user: UserIdentity) -> Result<(), String> {
        validate_email(&user.email)?;
        info!("用户已登录: {}", user.email);
        if let Ok(mut current) = self.user.write() {
            *current = Some(user);
        }
        Ok(())
    }

    pub fn sign_out(&self) {
        if let Ok(mut current) = self.user.write() {
            if current.take().is_some() {
                info!("用户已退出登录");
            }
        }
    }
}

impl IdentityProvider for SharedIdentity {
    fn current_user(&self) -> Option<UserIdentity> {
        self.user.read().ok().and_then(|user| user.clone())
    }
}

/// 固定身份（命令行运行时使用）
pub struct StaticIdentity(pub Option<UserIdentity>);

impl StaticIdentity {
    pub fn from_email(email: Option<String>) -> Self {
        Self(email.map(|email| UserIdentity {
            email,
            name: String::new(),
            picture: String::new(),
        }))
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<UserIdentity> {
        self.0.clone()
    }
}

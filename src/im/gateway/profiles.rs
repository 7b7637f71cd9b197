//! 用户资料解析（缓存优先）

use crate::im::cache::{CacheKey, LocalCacheStore};
use crate::im::error::GatewayResult;
use crate::im::gateway::remote::RemoteGateway;
use crate::im::types::UserProfile;
use std::sync::Arc;
use tracing::debug;

/// 先查本地缓存再查远端；`force` 时跳过缓存并回填
#[derive(Clone)]
pub struct ProfileDirectory {
    gateway: Arc<dyn RemoteGateway>,
    cache: LocalCacheStore,
}

impl ProfileDirectory {
    pub fn new(gateway: Arc<dyn RemoteGateway>, cache: LocalCacheStore) -> Self {
        Self { gateway, cache }
    }

    pub async fn resolve(&self, user_id: &str, force: bool) -> GatewayResult<UserProfile> {
        let key = CacheKey::UserProfile(user_id.to_string());
        if !force {
            if let Some(profile) = self.cache.load::<UserProfile>(&key).await {
                return Ok(profile);
            }
        }

        debug!("[Profiles] 远端获取用户资料: {} (force={})", user_id, force);
        let profile = self.gateway.get_user(user_id).await?;
        self.cache.save(&key, &profile);
        Ok(profile)
    }

    /// 丢弃缓存的资料，下次解析走远端
    pub fn invalidate(&self, user_id: &str) {
        self.cache
            .remove(&CacheKey::UserProfile(user_id.to_string()));
    }
}

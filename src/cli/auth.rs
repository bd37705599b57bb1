// src/cli/auth.rs - login / logout

use super::Context;
use crate::auth::{request_tokens, TokenStore};
use crate::infra::errors::StudyError;

pub async fn login(ctx: &Context, email: &str, password: &str) -> anyhow::Result<()> {
    let tokens = request_tokens(
        &ctx.config.api.base_url,
        email,
        password,
        ctx.config.api.timeout(),
    )
    .await
    .map_err(|e| match e {
        StudyError::Unauthorized => anyhow::anyhow!("Invalid email or password"),
        other => anyhow::Error::new(other),
    })?;
    tokens.save()?;
    println!("Logged in as {email}");
    Ok(())
}

pub async fn logout(ctx: &Context) -> anyhow::Result<()> {
    TokenStore::clear()?;
    ctx.cache.clear()?;
    println!("Logged out");
    Ok(())
}

// src/cli/sessions.rs - Session corrections

use super::{Context, SessionAction};

pub async fn run_sessions(ctx: &Context, action: &SessionAction) -> anyhow::Result<()> {
    let gateway = ctx.gateway()?;
    match action {
        SessionAction::Edit { id, hours } => {
            gateway
                .edit_session(*id, *hours)
                .await
                .map_err(|e| ctx.fail(e))?;
            println!("Session {id} set to {hours:.2} h");
        }
        SessionAction::Delete { id } => {
            gateway.delete_session(*id).await.map_err(|e| ctx.fail(e))?;
            println!("Session {id} deleted");
        }
    }
    Ok(())
}

use async_trait::async_trait;
use tracing::info;

use crate::core::{Task, TaskArgs, TaskContext, TaskError, TaskOutputs};
use crate::domain::constants::{AMPHORA_ID, SERVER_PEM};

/// Issues the server certificate the amphora agent presents.
pub struct GenerateServerPem;

#[async_trait]
impl Task for GenerateServerPem {
    fn name(&self) -> &str {
        "generate-server-pem"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![SERVER_PEM]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora_id: String = args.get(AMPHORA_ID)?;
        let cert = ctx
            .certs
            .generate(&amphora_id, ctx.config.certificates.cert_validity_days)
            .await?;
        info!(%amphora_id, expires_at = %cert.expires_at, "Issued server certificate");
        TaskOutputs::single(SERVER_PEM, &cert)
    }
}

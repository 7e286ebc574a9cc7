use vmpool_common::{
    CpiError, CpiResult, ErrorKind, PowerState, ResultExt, TX_GROUP_CLOUD_MIGRATE,
    TX_GROUP_INSTANCE_UPGRADE, TX_GROUP_SERVICE_SETUP,
};
use vmpool_providers::ComputeProvider;

use crate::transactions::InstanceWaits;

/// The IaaS answers an upgrade order that it accepted at the quoted price
/// with this error text. The order is placed, so it is not a failure.
pub const PRICE_NOTICE: &str = "a current price was provided for the upgrade order";

/// Two baseline devices plus the new ephemeral one.
pub const MIN_BLOCK_DEVICES_AFTER_ATTACH: usize = 3;

fn is_price_notice(err: &CpiError) -> bool {
    err.root_message().to_lowercase().contains(PRICE_NOTICE)
}

/// Orders an ephemeral disk and waits until the instance is usable again.
pub struct EphemeralDiskAttacher<'a> {
    compute: &'a dyn ComputeProvider,
    waits: InstanceWaits<'a>,
}

impl<'a> EphemeralDiskAttacher<'a> {
    pub fn new(compute: &'a dyn ComputeProvider, waits: InstanceWaits<'a>) -> Self {
        Self { compute, waits }
    }

    pub async fn attach(&self, cid: u64, size_gb: u64) -> CpiResult<()> {
        self.waits
            .no_active_transactions(cid)
            .await
            .context("waiting for idle instance before disk upgrade")?;
        self.waits
            .last_transaction_complete(cid, &[TX_GROUP_SERVICE_SETUP])
            .await
            .context("waiting for instance setup before disk upgrade")?;

        match self.compute.attach_ephemeral_disk(cid, size_gb).await {
            Ok(0) => {
                tracing::info!(cid, size_gb, "no upgrade order placed; nothing to wait for");
                return Ok(());
            }
            Ok(order_id) => {
                tracing::info!(cid, size_gb, order_id, "ephemeral disk upgrade ordered");
            }
            Err(e) if is_price_notice(&e) => {
                tracing::info!(cid, size_gb, notice = %e, "upgrade order placed with price notice");
            }
            Err(e) => {
                return Err(e.push_context(format!(
                    "ordering {} GB ephemeral disk for instance {}",
                    size_gb, cid
                )))
            }
        }

        self.waits
            .has_active_transaction(cid)
            .await
            .context("waiting for disk upgrade to start")?;
        self.waits
            .no_active_transactions(cid)
            .await
            .context("waiting for disk upgrade to finish")?;
        self.waits
            .last_transaction_complete(cid, &[TX_GROUP_CLOUD_MIGRATE, TX_GROUP_INSTANCE_UPGRADE])
            .await
            .context("waiting for disk upgrade transaction")?;
        self.waits
            .power_state(cid, PowerState::Running)
            .await
            .context("waiting for instance to power on after disk upgrade")?;

        let devices = self
            .compute
            .get_block_devices(cid)
            .await
            .with_context(|| format!("listing block devices of instance {}", cid))?;
        if devices.len() < MIN_BLOCK_DEVICES_AFTER_ATTACH {
            return Err(CpiError::new(
                ErrorKind::ResourceExhausted,
                format!(
                    "instance {} has {} block devices after disk upgrade, expected at least {}",
                    cid,
                    devices.len(),
                    MIN_BLOCK_DEVICES_AFTER_ATTACH
                ),
            ));
        }
        tracing::info!(cid, devices = devices.len(), "ephemeral disk attached");
        Ok(())
    }
}

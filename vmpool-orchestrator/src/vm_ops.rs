use vmpool_common::{CpiResult, ErrorKind, PowerState, ResultExt};
use vmpool_providers::ComputeProvider;

use crate::logger::ActionLog;
use crate::transactions::InstanceWaits;
use crate::waiter::Waiter;

pub async fn has_vm(compute: &dyn ComputeProvider, cid: u64) -> CpiResult<bool> {
    match compute.get_instance(cid).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::VmNotFound => Ok(false),
        Err(e) => Err(e.push_context(format!("checking whether instance {} exists", cid))),
    }
}

/// Soft reboot, then wait for the instance to drop off and come back.
pub async fn reboot_vm(compute: &dyn ComputeProvider, waiter: &Waiter, cid: u64) -> CpiResult<()> {
    let log = ActionLog::start("reboot_instance", cid);
    let result = async {
        compute
            .reboot_instance(cid)
            .await
            .with_context(|| format!("rebooting instance {}", cid))?;
        let waits = InstanceWaits::new(compute, waiter);
        waits
            .not_pingable(cid)
            .await
            .context("waiting for instance to go down")?;
        waits
            .pingable(cid)
            .await
            .context("waiting for instance to come back")?;
        waits.power_state(cid, PowerState::Running).await
    }
    .await;
    log.finish(result)
}

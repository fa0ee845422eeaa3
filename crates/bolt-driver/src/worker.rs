//! Bootstrap for the two threads a cell runs.

use std::fmt;

use tracing::warn;

use crate::config::DriverConfig;

/// Which half of the cell's worker pair a thread is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerRole {
    Encoder,
    Decoder,
}

impl WorkerRole {
    fn pinned_core(self, config: &DriverConfig) -> Option<usize> {
        match self {
            WorkerRole::Encoder => config.encoder_core,
            WorkerRole::Decoder => config.decoder_core,
        }
    }

    /// SCHED_FIFO slot when realtime scheduling is requested. The decoder
    /// outranks the encoder: replies drive every state transition, and a
    /// starved decoder stalls the whole cell.
    #[cfg(target_os = "linux")]
    fn rt_priority(self) -> libc::c_int {
        match self {
            WorkerRole::Encoder => 60,
            WorkerRole::Decoder => 70,
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerRole::Encoder => "encoder",
            WorkerRole::Decoder => "decoder",
        })
    }
}

/// Pin and prioritise the calling worker thread per the cell's config.
///
/// Both steps are best-effort: an unknown core or missing CAP_SYS_NICE
/// leaves the thread on OS defaults and the cell keeps running.
pub(crate) fn boot_worker(role: WorkerRole, cell: u64, config: &DriverConfig) {
    if let Some(core) = role.pinned_core(config) {
        if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
            warn!(cell, %role, core, "could not pin worker thread");
        }
    }

    if !config.realtime {
        return;
    }

    #[cfg(target_os = "linux")]
    {
        let param = libc::sched_param { sched_priority: role.rt_priority() };
        let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if rc != 0 {
            warn!(
                cell,
                %role,
                prio = param.sched_priority,
                "could not enter realtime scheduling"
            );
        }
    }
    #[cfg(not(target_os = "linux"))]
    warn!(cell, %role, "realtime scheduling is only supported on linux");
}

//! Prometheus metrics for observability
//!
//! All metrics live in the default registry and are exported by whatever
//! scrape endpoint the embedding process exposes. Counters and histograms
//! are registered once at first use via `lazy_static`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec,
    CounterVec, Gauge, Histogram, HistogramVec,
};

lazy_static! {
    /// Time from boot request to guest health-check success, in seconds
    pub static ref VM_BOOT_DURATION: Histogram = register_histogram!(
        "agentvisor_vm_boot_duration_seconds",
        "VM boot time from start request to guest readiness",
        vec![1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 80.0]
    )
    .unwrap();

    /// Number of booted, idle VMs available for assignment
    pub static ref POOL_READY_VMS: Gauge = register_gauge!(
        "agentvisor_pool_ready_vms",
        "Booted idle VMs available for assignment"
    )
    .unwrap();

    /// Number of VMs currently bound to an agent session
    pub static ref POOL_BUSY_VMS: Gauge = register_gauge!(
        "agentvisor_pool_busy_vms",
        "VMs currently bound to an agent session"
    )
    .unwrap();

    /// Tasks by terminal status (completed/failed/cancelled)
    pub static ref TASKS_TOTAL: CounterVec = register_counter_vec!(
        "agentvisor_tasks_total",
        "Tasks finalized, labelled by terminal status",
        &["status"]
    )
    .unwrap();

    /// Steps taken per agent session
    pub static ref SESSION_STEPS: Histogram = register_histogram!(
        "agentvisor_session_steps",
        "Loop iterations per agent session",
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0]
    )
    .unwrap();

    /// Tool calls dispatched, labelled by tool name and outcome
    pub static ref TOOL_CALLS_TOTAL: CounterVec = register_counter_vec!(
        "agentvisor_tool_calls_total",
        "Tool calls dispatched, labelled by tool and outcome",
        &["tool", "outcome"]
    )
    .unwrap();

    /// LLM completion latency per model
    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "agentvisor_llm_call_duration_seconds",
        "Chat completion latency",
        &["model"],
        vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .unwrap();

    /// Token consumption, labelled by kind (prompt/completion)
    pub static ref TOKENS_TOTAL: CounterVec = register_counter_vec!(
        "agentvisor_tokens_total",
        "LLM tokens consumed",
        &["kind"]
    )
    .unwrap();
}

//! Composition root: wire the helper client, VM manager, pool, LLM client
//! and orchestrator together, submit one task from argv and wait for it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use agentvisor::agent::AgentConfig;
use agentvisor::llm::{HttpLlmClient, LlmConfig};
use agentvisor::orchestrator::{JsonTaskStore, Orchestrator, OrchestratorConfig, TaskSpec};
use agentvisor::tools::{
    register_guest_tools, register_local_tools, CredentialResolver, ToolRegistry,
};
use agentvisor::vm::{HelperClient, VmManager, VmManagerConfig, VmPool};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Credentials loaded from a JSON file mapping token -> secret.
struct FileCredentialResolver {
    secrets: HashMap<String, String>,
}

impl FileCredentialResolver {
    fn load(path: Option<String>) -> Self {
        let secrets = path
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self { secrets }
    }
}

#[async_trait]
impl CredentialResolver for FileCredentialResolver {
    async fn resolve(&self, token: &str) -> Option<String> {
        self.secrets.get(token).cloned()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    agentvisor::tracing::init_tracing("agentvisor");

    let description: String = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if description.trim().is_empty() {
        eprintln!("usage: agentvisor <task description>");
        std::process::exit(2);
    }

    let helper = Arc::new(HelperClient::new(env_or(
        "AGENTVISOR_HELPER_SOCKET",
        "/var/run/agentvisor-helper.sock",
    )));
    let manager = Arc::new(VmManager::new(
        helper,
        VmManagerConfig {
            templates_dir: env_or("AGENTVISOR_TEMPLATES_DIR", "./templates").into(),
            vms_dir: env_or("AGENTVISOR_VMS_DIR", "./vms").into(),
            ..Default::default()
        },
    ));
    let max_vms: usize = env_or("AGENTVISOR_MAX_VMS", "4").parse()?;
    let pool = Arc::new(VmPool::new(
        Arc::clone(&manager),
        env_or("AGENTVISOR_TEMPLATE", "golden"),
        max_vms,
    ));

    let provider = Arc::new(HttpLlmClient::new(LlmConfig {
        base_url: env_or("AGENTVISOR_LLM_URL", "http://localhost:11434/v1"),
        model: env_or("AGENTVISOR_LLM_MODEL", "llama3.2"),
        api_key: std::env::var("AGENTVISOR_LLM_API_KEY").ok(),
        ..Default::default()
    }));
    let model = env_or("AGENTVISOR_LLM_MODEL", "llama3.2");

    let store = Arc::new(JsonTaskStore::new(env_or("AGENTVISOR_TASKS_DIR", "./tasks"))?);

    let http = reqwest::Client::new();
    let resolver: Arc<dyn CredentialResolver> = Arc::new(FileCredentialResolver::load(
        std::env::var("AGENTVISOR_CREDENTIALS").ok(),
    ));
    let tools_factory = {
        let http = http.clone();
        let resolver = Arc::clone(&resolver);
        Arc::new(move |transport: Arc<agentvisor::GuestTransport>| {
            let mut registry = ToolRegistry::new();
            register_guest_tools(&mut registry, Arc::clone(&transport));
            register_local_tools(&mut registry, http.clone(), Arc::clone(&resolver), transport);
            registry.register_interaction_tools();
            registry
        })
    };

    let orchestrator = Orchestrator::new(
        store,
        pool,
        provider,
        tools_factory,
        OrchestratorConfig {
            max_concurrent: env_or("AGENTVISOR_MAX_CONCURRENT", "3").parse()?,
            traces_dir: env_or("AGENTVISOR_TRACES_DIR", "./traces").into(),
            output_root: env_or("AGENTVISOR_OUTPUT_DIR", "./outputs").into(),
            agent: AgentConfig::default(),
        },
    );

    let mut spec = TaskSpec::new(description, "openai", model);
    spec.copy_count = env_or("AGENTVISOR_COPIES", "1").parse()?;
    spec.vm_id = std::env::var("AGENTVISOR_VM").ok();
    spec.skills = vec!["web".to_string()];

    let task_id = orchestrator.create_task(spec).await?;
    tracing::info!(task_id = %task_id, "task submitted");

    let task = orchestrator.wait_for_task(&task_id).await?;
    println!("task {} finished: {}", task.id, task.status.as_str());
    if let Some(summary) = &task.summary {
        println!("{}", summary);
    }
    if let Some(error) = &task.error {
        eprintln!("error: {}", error);
        std::process::exit(1);
    }
    Ok(())
}

//! Subcommand handlers.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::json;
use tracing::{info, warn};

use dso_common::{
    CancelFlag, DeviceId, DirArtifactSource, DsoConfig, EventBus, LoadedConfig,
    MutationOrchestrator, OrchestratorOptions, SessionError, SessionManager, VariantDetector,
};

use crate::output::{self, OutputContext};
use crate::progress::ProgressView;
use crate::ssh::SshTransport;

/// Everything a device command needs.
pub struct DeviceContext<'a> {
    pub config: &'a DsoConfig,
    pub out: OutputContext,
    pub cancel: CancelFlag,
}

impl DeviceContext<'_> {
    fn device_id(&self, query: &str) -> Result<DeviceId> {
        match self.config.find_device(query) {
            Some(device) => Ok(device.device_id()),
            None => {
                let known: Vec<String> = self
                    .config
                    .devices
                    .iter()
                    .map(|d| d.device_id().to_string())
                    .collect();
                bail!(
                    "unknown device '{query}'; configured devices: {}",
                    if known.is_empty() {
                        "none".to_string()
                    } else {
                        known.join(", ")
                    }
                )
            }
        }
    }

    fn manager(&self, bus: &EventBus) -> SessionManager<SshTransport> {
        let options = self.config.session_options();
        let transport = SshTransport::new(self.config.devices.clone(), options.command_timeout);
        SessionManager::new(transport, options).with_events(bus.clone())
    }

    fn orchestrator(&self, bus: &EventBus) -> MutationOrchestrator {
        self.orchestrator_with(bus, self.config.orchestrator_options())
    }

    fn orchestrator_with(
        &self,
        bus: &EventBus,
        options: OrchestratorOptions,
    ) -> MutationOrchestrator {
        let orchestrator = MutationOrchestrator::new(self.config.snapshot_store(), options)
            .with_events(bus.clone())
            .with_cancel_flag(self.cancel.clone());
        match self.config.run_history() {
            Some(history) => orchestrator.with_history(history),
            None => orchestrator,
        }
    }
}

fn session_failure(err: SessionError) -> anyhow::Error {
    let entry = err.cause().error_code().entry();
    anyhow!("{err}\n{}", entry.format_full())
}

pub fn devices(ctx: &DeviceContext<'_>) -> Result<bool> {
    if ctx.out.is_json() {
        let devices: Vec<_> = ctx
            .config
            .devices
            .iter()
            .map(|d| json!({ "id": d.device_id(), "alias": d.alias, "host": d.host }))
            .collect();
        ctx.out.json("devices", true, devices)?;
        return Ok(true);
    }

    ctx.out.header("Configured devices");
    if ctx.config.devices.is_empty() {
        println!("  none; add [[devices]] entries to the config file");
    }
    for device in &ctx.config.devices {
        match &device.alias {
            Some(alias) => println!("  {:<12} {}", alias, device.device_id()),
            None => println!("  {:<12} {}", "-", device.device_id()),
        }
    }
    Ok(true)
}

pub async fn detect(ctx: &DeviceContext<'_>, query: &str) -> Result<bool> {
    let id = ctx.device_id(query)?;
    let bus = EventBus::default();
    let mut manager = ctx.manager(&bus);
    let session = manager.connect(&id).await.map_err(session_failure)?;

    let detection = VariantDetector::new().detect(session).await;
    let found = detection.variant().is_some();
    if ctx.out.is_json() {
        ctx.out.json("detect", found, &detection)?;
    } else {
        ctx.out.header("Variant detection");
        output::print_detection(id.as_str(), &detection);
    }
    manager.disconnect().await;
    Ok(found)
}

pub async fn plan(ctx: &DeviceContext<'_>, query: &str) -> Result<bool> {
    let id = ctx.device_id(query)?;
    let bus = EventBus::default();
    let mut manager = ctx.manager(&bus);
    let session = manager.connect(&id).await.map_err(session_failure)?;

    let plan = ctx.orchestrator(&bus).plan(session).await;
    let ok = plan.can_proceed();
    if ctx.out.is_json() {
        ctx.out.json("plan", ok, &plan)?;
    } else {
        ctx.out.header("Mutation plan");
        output::print_plan(&plan);
    }
    manager.disconnect().await;
    Ok(ok)
}

pub async fn run(
    ctx: &DeviceContext<'_>,
    query: &str,
    artifacts: &Path,
    sequential: bool,
) -> Result<bool> {
    let id = ctx.device_id(query)?;
    let source = DirArtifactSource::new(artifacts)
        .with_context(|| format!("loading artifacts from {}", artifacts.display()))?;

    let bus = EventBus::default();
    let progress = ProgressView::attach(&bus, !ctx.out.is_json());
    let mut manager = ctx.manager(&bus);
    let session = match manager.connect(&id).await {
        Ok(session) => session,
        Err(err) => {
            if let Some(p) = progress {
                p.finish();
            }
            return Err(session_failure(err));
        }
    };
    let descriptor = session.descriptor().clone();
    info!(device = %id, version = %descriptor.software_version, "Starting install");

    let mut options = ctx.config.orchestrator_options();
    if sequential {
        options.parallel = false;
    }
    let result = ctx
        .orchestrator_with(&bus, options)
        .run(session, &descriptor, &source)
        .await;
    manager.disconnect().await;
    if let Some(p) = progress {
        p.finish();
    }

    if ctx.out.is_json() {
        ctx.out.json("run", result.success, &result)?;
    } else {
        output::print_result(&result);
    }
    Ok(result.success)
}

pub async fn decommission(ctx: &DeviceContext<'_>, query: &str) -> Result<bool> {
    let id = ctx.device_id(query)?;
    let bus = EventBus::default();
    let progress = ProgressView::attach(&bus, !ctx.out.is_json());
    let mut manager = ctx.manager(&bus);
    let session = match manager.connect(&id).await {
        Ok(session) => session,
        Err(err) => {
            if let Some(p) = progress {
                p.finish();
            }
            return Err(session_failure(err));
        }
    };
    let descriptor = session.descriptor().clone();

    let result = ctx.orchestrator(&bus).decommission(session, &descriptor).await;
    manager.disconnect().await;
    if let Some(p) = progress {
        p.finish();
    }

    if ctx.out.is_json() {
        ctx.out.json("decommission", result.success, &result)?;
    } else {
        output::print_result(&result);
    }
    Ok(result.success)
}

pub async fn restore(ctx: &DeviceContext<'_>, query: &str, snapshot: &str) -> Result<bool> {
    let id = ctx.device_id(query)?;
    let bus = EventBus::default();
    let progress = ProgressView::attach(&bus, !ctx.out.is_json());
    let mut manager = ctx.manager(&bus);
    let session = match manager.connect(&id).await {
        Ok(session) => session,
        Err(err) => {
            if let Some(p) = progress {
                p.finish();
            }
            return Err(session_failure(err));
        }
    };

    let report = ctx.orchestrator(&bus).restore(session, snapshot).await;
    manager.disconnect().await;
    if let Some(p) = progress {
        p.finish();
    }

    if ctx.out.is_json() {
        ctx.out.json("restore", report.result.success, &report)?;
    } else {
        ctx.out.header("Restore");
        output::print_restore(&report);
    }
    Ok(report.result.success)
}

pub fn snapshots_list(ctx: &DeviceContext<'_>, device: Option<&str>) -> Result<bool> {
    let store = ctx.config.snapshot_store();
    let mut snapshots = store.list()?;
    if let Some(query) = device {
        let id = ctx.device_id(query)?;
        snapshots.retain(|s| s.device_id.as_ref() == Some(&id));
    }

    if ctx.out.is_json() {
        ctx.out.json("snapshots list", true, &snapshots)?;
    } else {
        ctx.out.header(&format!("Snapshots in {}", store.root().display()));
        output::print_snapshots(&snapshots);
    }
    Ok(true)
}

pub fn snapshots_prune(
    ctx: &DeviceContext<'_>,
    keep: Option<usize>,
    device: Option<&str>,
) -> Result<bool> {
    let keep = keep.unwrap_or(ctx.config.snapshot.keep as usize);
    let store = ctx.config.snapshot_store();
    let deleted = match device {
        Some(query) => store.prune_device(&ctx.device_id(query)?, keep)?,
        None => store.prune(keep)?,
    };

    if ctx.out.is_json() {
        ctx.out.json("snapshots prune", true, json!({ "keep": keep, "deleted": deleted }))?;
    } else {
        println!("Kept the {keep} most recent; deleted {}", deleted.len());
        for id in &deleted {
            println!("  - {id}");
        }
    }
    Ok(true)
}

pub fn snapshots_delete(ctx: &DeviceContext<'_>, id: &str) -> Result<bool> {
    ctx.config.snapshot_store().delete(id)?;
    if ctx.out.is_json() {
        ctx.out.json("snapshots delete", true, json!({ "deleted": id }))?;
    } else {
        println!("Deleted snapshot {id}");
    }
    Ok(true)
}

pub fn history(ctx: &DeviceContext<'_>, device: Option<&str>, limit: usize) -> Result<bool> {
    let Some(history) = ctx.config.run_history() else {
        warn!("Run history is disabled in the config");
        bail!("run history is disabled ([history] enabled = false)");
    };
    let id = device.map(|q| ctx.device_id(q)).transpose()?;
    let entries = history.recent(limit, id.as_ref())?;

    if ctx.out.is_json() {
        ctx.out.json("history", true, &entries)?;
    } else {
        ctx.out.header("Recent runs");
        output::print_history(&entries);
    }
    Ok(true)
}

pub fn config_show(out: OutputContext, loaded: &LoadedConfig) -> Result<bool> {
    if out.is_json() {
        out.json(
            "config show",
            true,
            json!({
                "file": loaded.file,
                "config": loaded.config,
                "sources": loaded.value_sources(),
            }),
        )?;
        return Ok(true);
    }

    out.header("Effective configuration");
    match &loaded.file {
        Some(path) => println!("# loaded from {}", path.display()),
        None => println!("# no config file; built-in defaults"),
    }
    println!("{}", toml::to_string_pretty(&loaded.config)?);
    out.header("Sources");
    for source in loaded.value_sources() {
        println!("  {source}");
    }
    Ok(true)
}

/// Cancel the flag on Ctrl-C. The run stops at the next step boundary.
pub fn install_interrupt_handler(cancel: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current step");
            cancel.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use dso_common::DeviceConfig;

    fn config_with_device() -> DsoConfig {
        DsoConfig {
            devices: vec![DeviceConfig {
                host: "10.0.0.7".to_string(),
                user: "root".to_string(),
                port: Some(2222),
                identity_file: None,
                alias: Some("lab".to_string()),
            }],
            ..DsoConfig::default()
        }
    }

    #[test]
    fn test_device_lookup_by_alias_and_id() {
        let config = config_with_device();
        let ctx = DeviceContext {
            config: &config,
            out: OutputContext::new(true),
            cancel: CancelFlag::new(),
        };
        assert_eq!(ctx.device_id("lab").unwrap().as_str(), "root@10.0.0.7:2222");
        assert_eq!(
            ctx.device_id("root@10.0.0.7:2222").unwrap().as_str(),
            "root@10.0.0.7:2222"
        );
        let err = ctx.device_id("other").unwrap_err().to_string();
        assert!(err.contains("root@10.0.0.7:2222"));
    }

    #[test]
    fn test_prune_and_delete_on_empty_store() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = config_with_device();
        config.snapshot.root = tmp.path().to_path_buf();
        let ctx = DeviceContext {
            config: &config,
            out: OutputContext::new(true),
            cancel: CancelFlag::new(),
        };
        assert!(snapshots_prune(&ctx, Some(1), None).unwrap());
        assert!(snapshots_delete(&ctx, "missing-20240101T000000000Z").is_err());
    }

    #[test]
    fn test_history_disabled_is_an_error() {
        let mut config = config_with_device();
        config.history.enabled = false;
        let ctx = DeviceContext {
            config: &config,
            out: OutputContext::new(true),
            cancel: CancelFlag::new(),
        };
        assert!(history(&ctx, None, 10).is_err());
    }
}

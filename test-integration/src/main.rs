//! Manual smoke run of the full harvest pipeline against in-process stubs.
//!
//! Starts a fake vendor API, portal, inverter and store, runs one
//! collection cycle through every source, and prints the stats snapshot
//! plus everything the store received. Useful for eyeballing the wire
//! formats without touching real infrastructure.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use solharvest_agent::cache::CacheStore;
use solharvest_agent::collectors::{ApiCollector, RealtimeCollector, WebCollector};
use solharvest_agent::config::AgentConfig;
use solharvest_agent::model::SourceKind;
use solharvest_agent::stats::StatsTracker;
use solharvest_agent::writer::TimeSeriesWriter;
use solharvest_agent::{filter, normalize};
use solharvest_devkit::{ApiStub, ModbusStub, PortalStub, StoreStub};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = StoreStub::start().await?;
    let api = ApiStub::start().await?;
    let portal = PortalStub::start("demo", "demo-pw").await?;
    let inverter = ModbusStub::start().await?;

    api.respond(
        "/site/1/overview",
        serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "power": 4812.0,
            "energy_today": 18432.0
        }),
    );
    portal.set_page(
        "/dashboard",
        r#"<div class="device" data-serial="inv-1"><span class="power">4,812 W</span></div>"#,
    );
    inverter.set_f32(40083, 4812.4);

    let dir = tempfile::tempdir()?;
    let config = AgentConfig::from_toml(&format!(
        r#"
        [store]
        url = "{store_url}"
        org = "home"
        bucket = "solar"
        token = "smoke-token"

        [api]
        base_url = "{api_url}"
        site_id = "1"
        api_key = "smoke-key"

        [[api.endpoints]]
        id = "overview"
        device_id = "site-1"
        path = "/site/1/overview"
        timestamp_path = "timestamp"

        [[api.endpoints.measurements]]
        name = "ac_power"
        unit = "W"
        min = 0.0
        value_path = "power"

        [[api.endpoints.measurements]]
        name = "energy_today"
        unit = "Wh"
        min = 0.0
        value_path = "energy_today"

        [web]
        base_url = "{portal_url}"
        username = "demo"
        password = "demo-pw"

        [[web.endpoints]]
        id = "dashboard"
        device_id = "inv-1"
        path = "/dashboard"
        device_selector = ".device"

        [[web.endpoints.measurements]]
        name = "ac_power"
        unit = "W"
        selector = ".power"

        [modbus]
        host = "{modbus_host}"
        port = {modbus_port}

        [[modbus.endpoints]]
        id = "inverter"
        device_id = "inv-1"
        unit_id = 1

        [[modbus.endpoints.measurements]]
        name = "ac_power"
        unit = "W"
        register = 40083
        register_format = "f32"
        "#,
        store_url = store.url(),
        api_url = api.url(),
        portal_url = portal.url(),
        modbus_host = inverter.host(),
        modbus_port = inverter.port(),
    ))?;

    let cache = CacheStore::open(dir.path().join("cache"))?;
    let stats = StatsTracker::new();
    let writer = Arc::new(TimeSeriesWriter::new(
        config.store.clone(),
        config.writer.clone(),
        dir.path().join("spill.jsonl"),
        stats.clone(),
    )?);

    // One manual cycle per source, same stages the scheduler runs.
    let api_cfg = config.api.as_ref().unwrap();
    let collector = ApiCollector::new(
        api_cfg.clone(),
        cache.clone(),
        dir.path().join("quota.json"),
    )?;
    for descriptor in &api_cfg.endpoints {
        let payload = collector.collect(descriptor).await;
        stats.record_outcome(SourceKind::Api, &payload.outcome);
        let report = filter::filter(descriptor, normalize::normalize(descriptor, &payload));
        writer.enqueue(report.kept).await;
    }

    let web_cfg = config.web.as_ref().unwrap();
    let collector = WebCollector::new(
        web_cfg.clone(),
        cache.clone(),
        dir.path().join("session.json"),
    )?;
    for descriptor in &web_cfg.endpoints {
        let payload = collector.collect(descriptor).await;
        stats.record_outcome(SourceKind::Web, &payload.outcome);
        let report = filter::filter(descriptor, normalize::normalize(descriptor, &payload));
        writer.enqueue(report.kept).await;
    }

    let modbus_cfg = config.modbus.as_ref().unwrap();
    let collector = RealtimeCollector::new(modbus_cfg.clone());
    for descriptor in &modbus_cfg.endpoints {
        let payload = collector.collect(descriptor).await;
        stats.record_outcome(SourceKind::Modbus, &payload.outcome);
        let report = filter::filter(descriptor, normalize::normalize(descriptor, &payload));
        writer.enqueue(report.kept).await;
    }

    writer.flush().await;

    info!("store received {} lines:", store.line_count());
    for line in store.lines() {
        println!("{line}");
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&stats.snapshot())?
    );

    anyhow::ensure!(store.line_count() == 4, "expected 4 points at the store");
    info!("smoke run OK");
    Ok(())
}

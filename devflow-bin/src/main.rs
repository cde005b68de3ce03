use anyhow::{bail, Context};
use clap::Parser;
use devflow_common::Logger;
use devflow_config::{Config, HttpDeviceKind, ModbusDeviceKind, VictronDeviceKind};
use devflow_core::{DevicePool, DeviceRunner, ValueStorage};
use devflow_driver_http::create_http_driver;
use devflow_driver_modbus::{ModbusBus, WaveshareRelayDriver};
use devflow_driver_mqtt::MqttDeviceDriver;
use devflow_driver_vedirect::{RandomDriver, RandomKind, VedirectDriver};
use devflow_genset::{GensetService, InputMapping, Params};
use devflow_mqtt::{
    start_device_forwarders, ClientPool, DiscoveryAdvertiser, DiscoveryEntry, ForwarderSelection,
    MqttClient,
};
use devflow_sdk::{DeviceContext, Driver};
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

/// devflow - field device acquisition and fan-out hub
///
/// Ingests live measurements from VE.Direct, Modbus-RTU, HTTP-polled and
/// peered MQTT devices, keeps a typed latest-value store and fans the
/// values out to MQTT brokers, a WebSocket/HTTP read API and the
/// home-assistant discovery mechanism.
#[derive(Parser)]
#[command(name = "devflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "devflow", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "DEVFLOW_CONFIG", default_value = "devflow.yaml")]
    config: PathBuf,
}

fn selection_for(general: &devflow_config::GeneralSection, client: &str) -> ForwarderSelection {
    let allowed = |list: &[String]| list.is_empty() || list.iter().any(|c| c == client);
    ForwarderSelection {
        realtime: allowed(&general.realtime_via_mqtt_clients),
        telemetry: allowed(&general.telemetry_via_mqtt_clients),
        structure: true,
    }
}

fn genset_params(section: &devflow_config::GensetParamsSection) -> Params {
    Params {
        priming_timeout: section.priming_timeout,
        cranking_timeout: section.cranking_timeout,
        warm_up_timeout: section.warm_up_timeout,
        warm_up_temp: section.warm_up_temp,
        engine_cool_down_temp: section.engine_cool_down_temp,
        engine_cool_down_timeout: section.engine_cool_down_timeout,
        enclosure_cool_down_temp: section.enclosure_cool_down_temp,
        enclosure_cool_down_timeout: section.enclosure_cool_down_timeout,
        engine_temp_min: section.engine_temp_min,
        engine_temp_max: section.engine_temp_max,
        aux_temp0_min: section.aux_temp0_min,
        aux_temp0_max: section.aux_temp0_max,
        aux_temp1_min: section.aux_temp1_min,
        aux_temp1_max: section.aux_temp1_max,
        u_min: section.u_min,
        u_max: section.u_max,
        f_min: section.f_min,
        f_max: section.f_max,
        p_max: section.p_max,
        p_tot_max: section.p_tot_max,
    }
}

fn genset_mapping(section: &devflow_config::GensetInputsSection) -> InputMapping {
    InputMapping {
        arm_switch: section.arm_switch.clone(),
        command_switch: section.command_switch.clone(),
        reset_switch: section.reset_switch.clone(),
        io_available: section.io_available.clone(),
        engine_temp: section.engine_temp.clone(),
        aux_temp0: section.aux_temp0.clone(),
        aux_temp1: section.aux_temp1.clone(),
        output_available: section.output_available.clone(),
        u0: section.u0.clone(),
        u1: section.u1.clone(),
        u2: section.u2.clone(),
        f: section.f.clone(),
        l0: section.l0.clone(),
        l1: section.l1.clone(),
        l2: section.l2.clone(),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(e) => bail!("cannot load {}: {e}", cli.config.to_string_lossy()),
    };

    let debug_logging = config.log_storage_debug
        || config.mqtt_clients.values().any(|c| c.log_debug)
        || config.http_server.as_ref().is_some_and(|h| h.log_debug);
    let mut logger = Logger::new(Some(if debug_logging {
        Level::DEBUG
    } else {
        Level::INFO
    }));
    logger.initialize().map_err(anyhow::Error::msg)?;

    info!(title = %config.project_title, "starting devflow");
    if config.log_config {
        info!(
            mqtt_clients = config.mqtt_clients.len(),
            victron_devices = config.victron_devices.len(),
            modbus_devices = config.modbus_devices.len(),
            http_devices = config.http_devices.len(),
            mqtt_devices = config.mqtt_devices.len(),
            gensets = config.gensets.len(),
            views = config.views.len(),
            "configuration loaded"
        );
    }

    let root_cancel = CancellationToken::new();

    let state_storage = ValueStorage::new(config.log_storage_debug);
    let command_storage = ValueStorage::new(config.log_storage_debug);

    // broker sessions
    let mut pool = ClientPool::new();
    for (name, section) in &config.mqtt_clients {
        if config.log_worker_start {
            info!(client = %name, broker = %section.broker, "starting mqtt client");
        }
        let client = MqttClient::new(name.clone(), section.clone());
        client.start();
        pool.insert(client);
    }
    let pool = Arc::new(pool);

    // shared RS-485 buses
    let buses: HashMap<String, Arc<ModbusBus>> = config
        .modbus
        .iter()
        .map(|(name, section)| {
            (
                name.clone(),
                Arc::new(ModbusBus::new(
                    name.clone(),
                    section.device.clone(),
                    section.baud_rate,
                    section.read_timeout,
                    section.log_debug,
                )),
            )
        })
        .collect();

    // device drivers with supervised runners
    let mut devices = DevicePool::new();
    let mut generals: HashMap<String, devflow_config::GeneralSection> = HashMap::new();
    let mut runner_handles: Vec<JoinHandle<()>> = Vec::new();
    let mut start_runner = |driver: Arc<dyn Driver>,
                            context: Arc<DeviceContext>,
                            devices: &mut DevicePool| {
        if config.log_worker_start {
            info!(device = driver.name(), "starting device runner");
        }
        let runner = DeviceRunner::new(
            context,
            driver,
            Arc::clone(&state_storage),
            Arc::clone(&command_storage),
            root_cancel.child_token(),
        );
        devices.insert(Arc::clone(&runner));
        runner_handles.push(tokio::spawn(runner.run()));
    };

    for (name, section) in &config.victron_devices {
        generals.insert(name.clone(), section.general.clone());
        let context = DeviceContext::new(name.as_str(), section.general.settings());
        let driver: Arc<dyn Driver> = match section.kind {
            VictronDeviceKind::Vedirect => {
                let path = section.device.clone().context("validated device path")?;
                VedirectDriver::new(Arc::clone(&context), Arc::clone(&state_storage), path)
            }
            VictronDeviceKind::RandomBmv => RandomDriver::new(
                Arc::clone(&context),
                Arc::clone(&state_storage),
                RandomKind::Bmv,
            ),
            VictronDeviceKind::RandomSolar => RandomDriver::new(
                Arc::clone(&context),
                Arc::clone(&state_storage),
                RandomKind::Solar,
            ),
        };
        start_runner(driver, context, &mut devices);
    }

    for (name, section) in &config.modbus_devices {
        generals.insert(name.clone(), section.general.clone());
        let context = DeviceContext::new(name.as_str(), section.general.settings());
        let bus = buses
            .get(&section.bus)
            .context("validated bus reference")?;
        let driver: Arc<dyn Driver> = match section.kind {
            ModbusDeviceKind::WaveshareRtuRelay8 => WaveshareRelayDriver::new(
                Arc::clone(&context),
                Arc::clone(&state_storage),
                Arc::clone(bus),
                section.address,
                section.poll_interval,
                &section.relays,
            ),
        };
        start_runner(driver, context, &mut devices);
    }

    for (name, section) in &config.http_devices {
        generals.insert(name.clone(), section.general.clone());
        let context = DeviceContext::new(name.as_str(), section.general.settings());
        let kind = match section.kind {
            HttpDeviceKind::Teracom => devflow_driver_http::HttpDeviceKind::Teracom,
            HttpDeviceKind::Shelly3m => devflow_driver_http::HttpDeviceKind::Shelly3em,
        };
        let driver: Arc<dyn Driver> = create_http_driver(
            kind,
            Arc::clone(&context),
            Arc::clone(&state_storage),
            section.url.clone(),
            section.username.clone(),
            section.password.clone(),
            section.poll_interval,
        );
        start_runner(driver, context, &mut devices);
    }

    for (name, section) in &config.mqtt_devices {
        generals.insert(name.clone(), section.general.clone());
        let context = DeviceContext::new(name.as_str(), section.general.settings());
        let driver: Arc<dyn Driver> = MqttDeviceDriver::new(
            Arc::clone(&context),
            Arc::clone(&state_storage),
            Arc::clone(&pool),
            section.mqtt_topics.clone(),
            section.mqtt_clients.clone(),
        );
        start_runner(driver, context, &mut devices);
    }

    let devices = Arc::new(devices);

    // forwarders per (device x broker client)
    for runner in devices.iter() {
        let Some(general) = generals.get(runner.name()) else {
            continue;
        };
        for client in pool.iter() {
            start_device_forwarders(
                runner,
                client,
                &state_storage,
                selection_for(general, client.name()),
                config.log_worker_start,
            );
        }
    }

    // home-assistant discovery
    if !config.hass_discovery.is_empty() {
        let mut entries = Vec::new();
        for section in &config.hass_discovery {
            match DiscoveryEntry::from_section(section) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "skipping discovery entry"),
            }
        }
        DiscoveryAdvertiser::start(
            entries,
            Arc::clone(&pool),
            Arc::clone(&devices),
            Arc::clone(&state_storage),
            root_cancel.child_token(),
        );
    }

    // genset controllers
    for (name, section) in &config.gensets {
        if config.log_worker_start {
            info!(genset = %name, input_device = %section.input_device, "starting genset");
        }
        let service = GensetService {
            params: genset_params(&section.params),
            mapping: genset_mapping(&section.inputs),
            input_device: section.input_device.clone(),
            output_device: section
                .output_device
                .clone()
                .unwrap_or_else(|| name.clone()),
        };
        tokio::spawn(service.run(Arc::clone(&state_storage), root_cancel.child_token()));
    }

    // http surface
    let mut server_handle = None;
    if let Some(http) = &config.http_server {
        let state = devflow_web::build_state(
            &config,
            Arc::clone(&state_storage),
            Arc::clone(&command_storage),
            Arc::clone(&devices),
        )
        .map_err(anyhow::Error::msg)?;
        server_handle = Some(tokio::spawn(devflow_web::run_server(
            http.bind.clone(),
            http.port,
            http.log_requests,
            state,
            root_cancel.child_token(),
        )));
    }

    info!("startup completed");
    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("shutting down");

    // cancel drivers and forwarders, then let the runners publish their
    // final availability before the broker sessions go away
    root_cancel.cancel();
    for handle in runner_handles {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.shutdown().await;
    state_storage.close();
    command_storage.close();
    if let Some(handle) = server_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    info!("shutdown completed");
    Ok(())
}

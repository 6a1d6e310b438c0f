//! Application assembly: build every component from the parsed config and
//! hand them to the supervisor.
//!
//! Nothing here is global. The spool, sinks, limiter and metrics are built
//! once and injected explicitly; the supervisor owns the lifecycles.

use crate::breaker::SinkBreaker;
use crate::config::{Config, LogLevel, SinkKind};
use crate::error::{SinkError, SpoolError};
use crate::health::{HealthServer, HealthState};
use crate::limiter::TokenBucket;
use crate::listener::{
    EnqueueHandle, FileTailListener, FlowsUdpListener, Listener, NmeaUdpListener,
    ServiceDiscoveryListener, SimListener, SnmpTrapListener, SyslogUdpListener, WeatherConfig,
    WeatherPoller,
};
use crate::metrics::Metrics;
use crate::shipper::{Shipper, ShipperConfig, SinkRuntime, Tunables};
use crate::sink::{FileSink, HttpSink, HttpSinkConfig, Sink, TlsSettings};
use crate::spool::{DiskSpool, DiskSpoolConfig, MemorySpool, Spool};
use crate::supervisor::{ExitReason, SupervisedTask, Supervisor, SupervisorError, TaskError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Installed by the binary so SIGHUP can retune the log filter.
pub type LevelReloadFn = Box<dyn Fn(LogLevel) + Send + Sync>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Spool(#[from] SpoolError),
    #[error("sink setup failed: {0}")]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// The assembled edge node, ready to run.
pub struct EdgeBot {
    config: Config,
    config_path: PathBuf,
}

impl EdgeBot {
    pub fn new(config: Config, config_path: PathBuf) -> Self {
        EdgeBot {
            config,
            config_path,
        }
    }

    /// Builds the data plane and runs until a shutdown signal.
    pub async fn run(self, level_reload: Option<LevelReloadFn>) -> Result<ExitReason, AppError> {
        let config = self.config;
        let metrics = Metrics::new();

        let spool: Arc<dyn Spool> = if config.buffer.disk_buffer {
            Arc::new(DiskSpool::open(
                &config.buffer.disk_buffer_path,
                DiskSpoolConfig {
                    max_bytes: config.buffer.disk_buffer_max_size.as_u64(),
                    ..DiskSpoolConfig::default()
                },
            )?)
        } else {
            info!("disk buffer disabled, events will not survive restarts");
            Arc::new(MemorySpool::new(config.buffer.max_size))
        };

        let signal = Arc::new(Notify::new());
        let enqueue = EnqueueHandle::new(
            Arc::clone(&spool),
            Arc::clone(&signal),
            Arc::clone(&metrics),
            config.clock_skew_bound(),
        );

        let sink: Arc<dyn Sink> = match config.output.primary.kind {
            SinkKind::Http => Arc::new(HttpSink::new(HttpSinkConfig {
                url: config.output.primary.url.clone(),
                auth_token: config.output.primary.auth_token.clone(),
                compression: config.output.primary.compression,
                timeout: config.output.primary.timeout(),
                tls: TlsSettings {
                    verify: config.output.primary.tls.verify,
                    client_cert: config.output.primary.tls.client_cert.clone(),
                    client_key: config.output.primary.tls.client_key.clone(),
                    ca_bundle: config.output.primary.tls.ca_bundle.clone(),
                },
            })?),
            SinkKind::File => Arc::new(FileSink::from_url(
                &config.output.primary.url,
                config.output.primary.compression,
            )?),
        };
        let sinks = vec![SinkRuntime {
            sink,
            breaker: SinkBreaker::new(config.breaker_config()),
            retry: config.retry_policy(),
        }];

        let tunables = Tunables::new(
            config.batching.max_size,
            config.batching.max_bytes.as_u64() as usize,
            config.batching.timeout(),
        );
        let shipper = Arc::new(Shipper::new(
            Arc::clone(&spool),
            Arc::clone(&signal),
            TokenBucket::new(config.rate_limit.capacity, config.rate_limit.refill_per_sec),
            sinks,
            Arc::clone(&metrics),
            Arc::clone(&tunables),
            ShipperConfig {
                node_id: config.node_id.clone(),
                lease: config.claim_lease(),
                housekeeping_interval: Duration::from_secs(60),
                dead_retention: Duration::from_secs(7 * 24 * 60 * 60),
                rate_mode: config.rate_limit.mode,
            },
        ));

        let health = HealthState::new();
        let health_server = HealthServer::new(
            config.bind_addr().map_err(|e| AppError::Config(e.to_string()))?,
            Arc::clone(&health),
            Arc::clone(&metrics),
            Arc::clone(&spool),
        );

        let mut tasks: Vec<Arc<dyn SupervisedTask>> = Vec::new();
        if config.inputs.syslog.enabled {
            let bind = format!(
                "{}:{}",
                config.inputs.syslog.host, config.inputs.syslog.udp_port
            )
            .parse()
            .map_err(|e| AppError::Config(format!("inputs.syslog bind address: {e}")))?;
            tasks.push(Arc::new(ListenerTask {
                listener: Arc::new(SyslogUdpListener::new(bind)),
                enqueue: enqueue.clone(),
            }));
        }
        if config.inputs.files.enabled {
            tasks.push(Arc::new(ListenerTask {
                listener: Arc::new(FileTailListener::new(
                    config.inputs.files.paths.clone(),
                    Duration::from_millis(config.inputs.files.scan_interval_ms.max(100)),
                    config.inputs.files.from_beginning,
                )),
                enqueue: enqueue.clone(),
            }));
        }
        if config.inputs.snmp.enabled {
            let bind = format!("{}:{}", config.inputs.snmp.host, config.inputs.snmp.trap_port)
                .parse()
                .map_err(|e| AppError::Config(format!("inputs.snmp bind address: {e}")))?;
            tasks.push(Arc::new(ListenerTask {
                listener: Arc::new(SnmpTrapListener::new(bind)),
                enqueue: enqueue.clone(),
            }));
        }
        if config.inputs.weather.enabled {
            let (Some(latitude), Some(longitude)) = (
                config.inputs.weather.latitude,
                config.inputs.weather.longitude,
            ) else {
                return Err(AppError::Config(
                    "inputs.weather requires latitude and longitude".to_string(),
                ));
            };
            tasks.push(Arc::new(ListenerTask {
                listener: Arc::new(WeatherPoller::new(WeatherConfig {
                    url: config.inputs.weather.url.clone(),
                    latitude,
                    longitude,
                    interval: Duration::from_secs(config.inputs.weather.interval_sec.max(60)),
                    timeout: Duration::from_secs(config.inputs.weather.timeout_sec.max(1)),
                })),
                enqueue: enqueue.clone(),
            }));
        }
        if config.inputs.nmea.enabled {
            let bind = format!("{}:{}", config.inputs.nmea.host, config.inputs.nmea.udp_port)
                .parse()
                .map_err(|e| AppError::Config(format!("inputs.nmea bind address: {e}")))?;
            tasks.push(Arc::new(ListenerTask {
                listener: Arc::new(NmeaUdpListener::new(bind)),
                enqueue: enqueue.clone(),
            }));
        }
        if config.inputs.flows.enabled {
            tasks.push(Arc::new(ListenerTask {
                listener: Arc::new(FlowsUdpListener::new(
                    config.inputs.flows.host.clone(),
                    &config.inputs.flows.netflow_ports,
                    &config.inputs.flows.ipfix_ports,
                    &config.inputs.flows.sflow_ports,
                )),
                enqueue: enqueue.clone(),
            }));
        }
        if config.inputs.discovery.enabled {
            tasks.push(Arc::new(ListenerTask {
                listener: Arc::new(ServiceDiscoveryListener::new(
                    Duration::from_secs(config.inputs.discovery.interval_sec.max(10)),
                    config.inputs.discovery.extra_logs.clone(),
                )),
                enqueue: enqueue.clone(),
            }));
        }
        if config.inputs.sim.enabled {
            tasks.push(Arc::new(ListenerTask {
                listener: Arc::new(SimListener::new(Duration::from_millis(
                    config.inputs.sim.interval_ms.max(1),
                ))),
                enqueue: enqueue.clone(),
            }));
        }
        tasks.push(Arc::new(HealthTask {
            server: health_server,
        }));

        let supervisor = Supervisor::new(
            tasks,
            Arc::new(ShipperTask(Arc::clone(&shipper))),
            Arc::clone(&health),
            Arc::clone(&metrics),
            config.restart_policy(),
            config.shutdown_grace(),
        );

        let on_sighup = {
            let shipper = Arc::clone(&shipper);
            let tunables = Arc::clone(&tunables);
            let config_path = self.config_path.clone();
            Box::new(move || match Config::load(&config_path) {
                Ok(fresh) => {
                    tunables.update(
                        fresh.batching.max_size,
                        fresh.batching.max_bytes.as_u64() as usize,
                        fresh.batching.timeout(),
                    );
                    shipper.reconfigure_rate_limit(
                        fresh.rate_limit.capacity,
                        fresh.rate_limit.refill_per_sec,
                    );
                    if let Some(set_level) = &level_reload {
                        set_level(fresh.log.level);
                    }
                    info!("safe tunables reloaded");
                }
                Err(e) => warn!(error = %e, "SIGHUP reload failed, keeping current settings"),
            }) as Box<dyn FnMut() + Send>
        };

        Ok(supervisor.run(Some(on_sighup)).await?)
    }
}

/// Adapts a [`Listener`] to the supervised-task contract.
struct ListenerTask {
    listener: Arc<dyn Listener>,
    enqueue: EnqueueHandle,
}

#[async_trait]
impl SupervisedTask for ListenerTask {
    fn name(&self) -> &str {
        self.listener.name()
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), TaskError> {
        self.listener
            .run(cancel, self.enqueue.clone())
            .await
            .map_err(|e| Box::new(e) as TaskError)
    }

    fn healthy(&self) -> bool {
        self.listener.healthy()
    }
}

/// The shipper as a supervised task; the supervisor stops it last.
struct ShipperTask(Arc<Shipper>);

#[async_trait]
impl SupervisedTask for ShipperTask {
    fn name(&self) -> &str {
        "shipper"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), TaskError> {
        self.0.run(cancel).await;
        Ok(())
    }

    fn healthy(&self) -> bool {
        self.0.healthy()
    }
}

struct HealthTask {
    server: HealthServer,
}

#[async_trait]
impl SupervisedTask for HealthTask {
    fn name(&self) -> &str {
        "health"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), TaskError> {
        self.server
            .serve(cancel)
            .await
            .map_err(|e| Box::new(e) as TaskError)
    }

    fn healthy(&self) -> bool {
        true
    }
}

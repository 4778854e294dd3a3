// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! App Composition: owns every long-lived component
//! (identity, storage, groups, caches, account channel, observable bus).
//! The caller drives the lifecycle by polling `shutdown_requested`/
//! `all_units_stopped` from its own event loop; this module holds state,
//! it does not run one.

use crate::account::AccountChannel;
use crate::app_home;
use crate::control::ObservableBus;
use crate::core_cache::CoreCache;
use crate::error::Result;
use crate::group::Group;
use crate::group::Config as GroupConfig;
use crate::http_client::HttpClient;
use crate::identity::Identity;
use crate::kv::{KvStore, KvTable};
use crate::resource::{GpuRegistry, NoDevices};
use crate::system::SystemMonitor;
use std::collections::HashMap;
use std::sync::Arc;

pub struct AppConfig {
    pub api_server: String,
    pub assignment_servers: Vec<String>,
    pub machine_name: String,
}

/// Everything the running client owns. Construction never touches the
/// network; `tick` drives all I/O.
pub struct App {
    pub identity: Identity,
    pub kv: KvStore,
    pub groups: HashMap<String, Group>,
    pub gpu_registry: GpuRegistry<NoDevices>,
    pub core_cache: CoreCache,
    pub account: AccountChannel,
    pub bus: ObservableBus,
    pub http: Arc<dyn HttpClient>,
    pub system: Arc<dyn SystemMonitor>,
    pub config: AppConfig,
    /// Group configs, keyed by group name (spec.md §3's "Groups persist
    /// their config on every change").
    pub groups_table: KvTable,
    /// WU state, keyed by id, persisted at or beyond `CORE`.
    pub units_table: KvTable,
    /// Completion records, keyed by WU id, written once at `DONE`.
    pub wu_log_table: KvTable,
    shutdown_requested: bool,
}

impl App {
    pub fn new(
        config: AppConfig,
        http: Arc<dyn HttpClient>,
        system: Arc<dyn SystemMonitor>,
    ) -> Result<Self> {
        let home = app_home::ensure_app_home().map_err(crate::error::FahError::Io)?;
        let kv = KvStore::open(home.join("db"))?;

        let identity_table = kv.table("config")?;
        let identity = Identity::load_or_generate(&identity_table)?;

        let groups_table = kv.table("groups")?;
        let units_table = kv.table("units")?;
        let wu_log_table = kv.table("wu_log")?;

        let mut default_group = Group::new(String::new());
        if let Some(persisted) = GroupConfig::reload(&groups_table, "")? {
            default_group.config = persisted;
        }
        let mut groups = HashMap::new();
        groups.insert(String::new(), default_group);

        let gpu_registry = GpuRegistry::new(NoDevices, kv.table("cores")?);
        let core_cache = CoreCache::new(app_home::get_app_home().join("cores"), kv.table("cores")?);
        let account = AccountChannel::new(kv.table("config")?);
        let bus = ObservableBus::default();

        Ok(Self {
            identity,
            kv,
            groups,
            gpu_registry,
            core_cache,
            account,
            bus,
            http,
            system,
            config,
            groups_table,
            units_table,
            wu_log_table,
            shutdown_requested: false,
        })
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
        for group in self.groups.values_mut() {
            group.config.finish = true;
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// True once every group has no WU still occupying a kernel (i.e. it is
    /// safe to invoke the shutdown callback per spec.md §4.4).
    pub fn all_units_stopped(&self) -> bool {
        self.groups.values().all(|g| {
            g.units
                .iter()
                .all(|u| !matches!(u.state, crate::unit::UnitState::Run))
        })
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.get_mut(name)
    }

    /// Return the named group, creating and persisting a default-config one
    /// if it doesn't exist yet.
    pub fn ensure_group(&mut self, name: &str) -> &mut Group {
        if !self.groups.contains_key(name) {
            let group = Group::new(name.to_string());
            let _ = group.config.persist(&self.groups_table, name);
            self.groups.insert(name.to_string(), group);
        }
        self.groups.get_mut(name).expect("just inserted")
    }

    /// Drive every WU's network-facing state transition one step: Assign,
    /// Download, Upload, and Dump each own a signed HTTP exchange (see
    /// `crate::unit::ops`); Core/RunPaused/Run are owned by the Kernel
    /// Supervisor and are left untouched here. A unit with `wait_until` in
    /// the future is skipped — that's its retry backoff.
    pub async fn tick(&mut self, now: std::time::SystemTime) {
        let assign_server = match self.config.assignment_servers.first() {
            Some(server) => server.clone(),
            None => return,
        };
        let http = Arc::clone(&self.http);
        let mut finished = Vec::new();

        for group in self.groups.values_mut() {
            for unit in group.units.iter_mut() {
                if let Some(wait_until) = unit.wait_until {
                    if now < wait_until {
                        continue;
                    }
                }
                unit.wait_until = None;

                let state = unit.state;
                let outcome = match state {
                    crate::unit::UnitState::Assign => Some(unit.assign(http.as_ref(), &assign_server).await),
                    crate::unit::UnitState::Download => {
                        let unit_dir = app_home::get_work_dir(&unit.id);
                        Some(unit.download(http.as_ref(), &unit_dir).await)
                    }
                    crate::unit::UnitState::Upload => Some(unit.upload(http.as_ref()).await),
                    crate::unit::UnitState::Dump => Some(unit.send_dump(http.as_ref()).await),
                    _ => None,
                };

                let Some(outcome) = outcome else { continue };
                match outcome {
                    Ok(()) => unit.retry.maybe_reset(unit.get_run_time(now)),
                    Err(e) => {
                        tracing::warn!(unit = %unit.id, state = ?state, error = %e, "unit operation failed");
                        if unit.retry.bump(state) {
                            unit.on_retries_exceeded();
                        } else {
                            unit.wait_until = Some(now + unit.retry.wait());
                        }
                    }
                }

                if let crate::unit::UnitState::Done(reason) = unit.state {
                    finished.push((group.name.clone(), unit.id.clone(), reason));
                }
            }
        }

        for (group_name, id, reason) in finished {
            self.finalize_unit(&group_name, &id, reason, now);
        }
    }

    /// A WU reached `DONE`: write its credit-record entry to `wu_log`, erase
    /// its `units` row, and drop it from the group's in-memory list. Credit
    /// is read from the downloaded WU's own claim, if any; the server is the
    /// authority on the actual award.
    fn finalize_unit(&mut self, group_name: &str, id: &str, reason: crate::unit::DoneReason, now: std::time::SystemTime) {
        let Some(group) = self.groups.get_mut(group_name) else { return };
        let Some(pos) = group.units.iter().position(|u| u.id == id) else { return };
        let unit = group.units.remove(pos);

        let credit = unit
            .data
            .wu
            .as_ref()
            .and_then(|wu| wu.data.get("credit"))
            .and_then(serde_json::Value::as_f64);

        let record = crate::unit::CompletionRecord::new(&unit, reason, credit, now);
        if let Err(e) = record.persist(&self.wu_log_table) {
            tracing::warn!(unit = %id, error = %e, "failed to persist completion record");
        }
        if let Err(e) = crate::unit::Unit::erase(&self.units_table, id) {
            tracing::warn!(unit = %id, error = %e, "failed to erase finished unit");
        }
    }
}

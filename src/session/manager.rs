use super::*;

impl SessionManager {
    /// Creates an empty session cache.
    pub fn new(
        config: Arc<AgentConfig>,
        inventory: Arc<Inventory>,
        credentials: CredentialStore,
        factory: Arc<dyn DriverFactory>,
    ) -> Self {
        // No moka capacity: a size eviction could drop a busy slot and let a
        // second session open. `enforce_capacity` only closes idle ones.
        let cache = Cache::builder().build();
        Self {
            cache,
            config,
            inventory,
            credentials: RwLock::new(Arc::new(credentials)),
            factory,
        }
    }

    /// Replaces the credential list.
    ///
    /// Cached sessions keep their credential; a session whose device now
    /// resolves to a different credential is replaced on its next use.
    pub async fn reload_credentials(&self, credentials: CredentialStore) {
        debug!("reloading {} credential rules", credentials.len());
        *self.credentials.write().await = Arc::new(credentials);
    }

    async fn resolve_credential(&self, device_name: &str) -> Result<Arc<Credential>, AgentError> {
        self.credentials.read().await.resolve(device_name)
    }

    /// Returns exclusive use of the device's session, connecting if needed.
    ///
    /// Callers for the same device queue on the session; the returned guard
    /// never refers to a session that is still connecting.
    pub async fn acquire(&self, device_name: &str) -> Result<SessionGuard, AgentError> {
        let device = self.inventory.device(device_name)?;
        loop {
            let entry = self
                .cache
                .entry(device.name.clone())
                .or_insert_with(async {
                    debug!("{}: new session slot", device.name);
                    Arc::new(SessionSlot::new(device.clone()))
                })
                .await;
            if entry.is_fresh() {
                self.enforce_capacity(&device.name).await;
            }
            let slot = entry.into_value();
            let mut session = slot.session.clone().lock_owned().await;

            if slot.is_killed() || matches!(session.state, SessionState::Closing | SessionState::Closed) {
                if session.state != SessionState::Closed {
                    session.close().await;
                }
                self.forget(&device.name, &slot).await;
                continue;
            }

            let credential = match self.resolve_credential(&device.name).await {
                Ok(credential) => credential,
                Err(e) => {
                    self.retire(&device.name, &slot, &mut session).await;
                    return Err(e);
                }
            };

            let needs_connect = match session.state {
                SessionState::Connecting => true,
                _ => {
                    let rotated = session
                        .credential
                        .as_ref()
                        .is_none_or(|current| current.fingerprint() != credential.fingerprint());
                    let alive = session.driver.as_ref().is_some_and(|d| d.is_alive());
                    if rotated {
                        debug!("{}: credential changed, replacing session", device.name);
                    } else if !alive {
                        debug!("{}: cached session is dead, reconnecting", device.name);
                    } else {
                        debug!("{}: reusing session", device.name);
                    }
                    rotated || !alive
                }
            };

            if needs_connect {
                if let Err(e) = self.connect(&mut session, credential).await {
                    self.retire(&device.name, &slot, &mut session).await;
                    return Err(e);
                }
            }

            session.state = SessionState::Busy;
            return Ok(SessionGuard {
                session: Some(session),
                slot,
            });
        }
    }

    /// Releases a session acquired with [`SessionManager::acquire`].
    pub fn release(&self, guard: SessionGuard) {
        drop(guard);
    }

    /// Runs `operation` on the device's session.
    ///
    /// A retryable failure tears the connection down and the operation is
    /// attempted once more on a fresh connection. A second failure is
    /// returned to the caller and the session is discarded.
    pub async fn execute(&self, device_name: &str, operation: &Operation) -> Result<Outcome, AgentError> {
        let mut guard = self.acquire(device_name).await?;
        let first = match guard.perform(operation).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_retryable() => e,
            Err(e) => {
                if e.poisons_session() {
                    self.retire_guard(guard).await;
                }
                return Err(e);
            }
        };

        warn!(
            "{device_name}: {} failed ({first}), retrying on a new connection",
            operation.name()
        );
        let reconnected = match self.resolve_credential(device_name).await {
            Ok(credential) => {
                let session = guard.session_mut();
                self.connect(session, credential).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = reconnected {
            self.retire_guard(guard).await;
            return Err(e);
        }
        guard.session_mut().state = SessionState::Busy;

        match guard.perform(operation).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if e.poisons_session() {
                    self.retire_guard(guard).await;
                }
                Err(e)
            }
        }
    }

    /// (Re)connects `session` with `credential`, trying each address in
    /// order.
    async fn connect(&self, session: &mut Session, credential: Arc<Credential>) -> Result<(), AgentError> {
        if let Some(mut old) = session.driver.take() {
            old.disconnect().await;
        }
        session.state = SessionState::Connecting;
        session.credential = None;
        session.address = None;

        let device = &session.device;
        if device.addresses.is_empty() {
            return Err(AgentError::NoAddresses(device.name.clone()));
        }
        let timeout = self.factory.timeouts(device.device_type).connect;
        let mut last_error = None;
        for address in &device.addresses {
            let mut driver = self.factory.create(device, &credential)?;
            debug!(
                "{}: connecting to {address} as {} with {}",
                device.name,
                credential.username,
                driver.name()
            );
            match driver.connect(address, &credential, timeout).await {
                Ok(()) => {
                    debug!("{}: connected to {address}", device.name);
                    session.driver = Some(driver);
                    session.credential = Some(credential);
                    session.address = Some(address.clone());
                    session.state = SessionState::IdleReady;
                    session.last_active = Instant::now();
                    return Ok(());
                }
                Err(e) => {
                    error!("{}: connect to {address} failed: {e}", device.name);
                    driver.disconnect().await;
                    if matches!(e, AgentError::Auth(_)) {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| AgentError::NoAddresses(device.name.clone())))
    }

    /// Closes a locked session and drops its slot from the cache.
    async fn retire(&self, name: &str, slot: &Arc<SessionSlot>, session: &mut Session) {
        session.close().await;
        self.forget(name, slot).await;
    }

    async fn retire_guard(&self, mut guard: SessionGuard) {
        let slot = guard.slot.clone();
        let session = guard.session_mut();
        let name = session.device.name.clone();
        debug!("{name}: discarding session");
        session.close().await;
        self.forget(&name, &slot).await;
    }

    /// Removes `slot` from the cache unless it has already been replaced.
    async fn forget(&self, name: &str, slot: &Arc<SessionSlot>) {
        if let Some(current) = self.cache.get(name).await {
            if Arc::ptr_eq(&current, slot) {
                self.cache.invalidate(name).await;
            }
        }
    }

    /// Closes least recently used idle sessions until at most
    /// `max_sessions` remain, not counting closed slots.
    ///
    /// Sessions in use are never closed, so the limit can be exceeded
    /// while every cached session is busy.
    async fn enforce_capacity(&self, keep: &str) {
        let max = self.config.options.max_sessions.max(1);
        let slots: Vec<(Arc<String>, Arc<SessionSlot>)> = self.cache.iter().collect();
        if slots.len() <= max {
            return;
        }
        let mut live = 0;
        let mut idle = Vec::new();
        for (name, slot) in slots {
            if name.as_str() == keep {
                live += 1;
                continue;
            }
            let Ok(session) = slot.session.clone().try_lock_owned() else {
                live += 1;
                continue;
            };
            match session.state {
                SessionState::Closed => self.forget(&name, &slot).await,
                SessionState::IdleReady => {
                    live += 1;
                    idle.push((session.last_active, name, slot, session));
                }
                _ => live += 1,
            }
        }
        if live <= max {
            return;
        }
        let excess = live - max;
        if idle.len() < excess {
            warn!("{live} sessions cached, limit is {max}, the rest are in use");
        }
        idle.sort_by_key(|(last_active, ..)| *last_active);
        for (_, name, slot, mut session) in idle.into_iter().take(excess) {
            debug!("{name}: least recently used, closing to stay within {max} sessions");
            self.retire(&name, &slot, &mut session).await;
        }
    }

    /// Disconnects and removes every idle session that has been unused for
    /// longer than its device type's idle timeout.
    ///
    /// Sessions in use are never touched. Returns the number evicted.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let slots: Vec<(Arc<String>, Arc<SessionSlot>)> = self.cache.iter().collect();
        let mut evicted = 0;
        for (name, slot) in slots {
            let Ok(mut session) = slot.session.clone().try_lock_owned() else {
                continue;
            };
            if session.state == SessionState::Closed {
                self.forget(&name, &slot).await;
                continue;
            }
            if session.state != SessionState::IdleReady {
                continue;
            }
            let idle_timeout = self.config.idle_timeout_for(session.device.device_type);
            let idle = now.saturating_duration_since(session.last_active);
            if idle <= idle_timeout {
                continue;
            }
            debug!("{name}: idle for {idle:?}, evicting");
            self.retire(&name, &slot, &mut session).await;
            evicted += 1;
        }
        evicted
    }

    /// Force-disconnects every session.
    ///
    /// Idle sessions are closed and removed immediately. A session in use
    /// stays cached, so later callers for its device queue behind it, and
    /// is closed as soon as its guard is released. Returns the number of
    /// sessions torn down.
    pub async fn kill_all(&self) -> usize {
        let slots: Vec<(Arc<String>, Arc<SessionSlot>)> = self.cache.iter().collect();
        let mut killed = 0;
        for (name, slot) in slots {
            slot.killed.store(true, Ordering::Release);
            match slot.session.clone().try_lock_owned() {
                Ok(mut session) => {
                    let was_open = session.state != SessionState::Closed;
                    if was_open {
                        session.close().await;
                        debug!("{name}: killed");
                    }
                    self.forget(&name, &slot).await;
                    if !was_open {
                        continue;
                    }
                }
                Err(_) => debug!("{name}: in use, will be killed on release"),
            }
            killed += 1;
        }
        killed
    }

    /// Current state of every cached session, keyed by device name.
    ///
    /// Sessions locked by a caller report [`SessionState::Busy`].
    pub fn snapshot(&self) -> BTreeMap<String, SessionState> {
        self.cache
            .iter()
            .map(|(name, slot)| {
                let state = match slot.session.try_lock() {
                    Ok(session) => session.state,
                    Err(_) => SessionState::Busy,
                };
                (name.to_string(), state)
            })
            .filter(|(_, state)| *state != SessionState::Closed)
            .collect()
    }

    /// Runs [`SessionManager::evict_idle`] every `period` until the manager
    /// is dropped or the task is aborted.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let evicted = manager.evict_idle().await;
                if evicted > 0 {
                    debug!("idle sweep evicted {evicted} sessions");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use crate::inventory::StaticInventory;
    use crate::config::Timeouts;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use async_trait::async_trait;

    /// Shared script and counters for every driver a [`StubFactory`] makes.
    #[derive(Default)]
    struct StubState {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        executes: AtomicUsize,
        in_use: AtomicUsize,
        max_in_use: AtomicUsize,
        connect_script: StdMutex<VecDeque<Result<(), AgentError>>>,
        execute_script: StdMutex<VecDeque<Result<Vec<u8>, AgentError>>>,
        dead: AtomicBool,
        passwords: StdMutex<Vec<Option<String>>>,
        addresses: StdMutex<Vec<String>>,
    }

    struct StubDriver {
        state: Arc<StubState>,
        connected: bool,
    }

    #[async_trait]
    impl DeviceDriver for StubDriver {
        fn name(&self) -> &str {
            "stub"
        }

        fn capabilities(&self) -> crate::driver::Capabilities {
            crate::driver::Capabilities::from([crate::driver::Capability::Execute])
        }

        async fn connect(&mut self, address: &str, credential: &Credential, _timeout: Duration) -> Result<(), AgentError> {
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            self.state.addresses.lock().unwrap().push(address.to_string());
            self.state.passwords.lock().unwrap().push(credential.password.clone());
            let scripted = self.state.connect_script.lock().unwrap().pop_front();
            scripted.unwrap_or(Ok(()))?;
            self.connected = true;
            self.state.dead.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(&mut self, command: &str, _mode: Option<&str>) -> Result<Vec<u8>, AgentError> {
            let now = self.state.in_use.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.max_in_use.fetch_max(now, Ordering::SeqCst);
            self.state.executes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.state.in_use.fetch_sub(1, Ordering::SeqCst);
            let scripted = self.state.execute_script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| Ok(command.as_bytes().to_vec()))
        }

        async fn disconnect(&mut self) {
            if self.connected {
                self.connected = false;
                self.state.disconnects.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_alive(&self) -> bool {
            self.connected && !self.state.dead.load(Ordering::SeqCst)
        }
    }

    struct StubFactory(Arc<StubState>);

    impl DriverFactory for StubFactory {
        fn create(&self, _device: &DeviceDescriptor, _credential: &Credential) -> Result<Box<dyn DeviceDriver>, AgentError> {
            Ok(Box::new(StubDriver {
                state: self.0.clone(),
                connected: false,
            }))
        }

        fn timeouts(&self, _device_type: DeviceType) -> Timeouts {
            Timeouts::default()
        }
    }

    fn credentials(password: &str) -> CredentialStore {
        CredentialStore::new(vec![
            Credential::new(".*", "netops")
                .expect("valid")
                .with_password(password),
        ])
    }

    fn manager_with(devices: Vec<DeviceDescriptor>) -> (Arc<SessionManager>, Arc<StubState>) {
        manager_with_config(AgentConfig::default(), devices)
    }

    fn manager_with_config(
        config: AgentConfig,
        devices: Vec<DeviceDescriptor>,
    ) -> (Arc<SessionManager>, Arc<StubState>) {
        let state = Arc::new(StubState::default());
        let inventory = Inventory::new().with_provider(0, Arc::new(StaticInventory::new("test", devices)));
        let manager = SessionManager::new(
            Arc::new(config),
            Arc::new(inventory),
            credentials("secret"),
            Arc::new(StubFactory(state.clone())),
        );
        (Arc::new(manager), state)
    }

    fn manager() -> (Arc<SessionManager>, Arc<StubState>) {
        manager_with(vec![
            DeviceDescriptor::new("ar1", DeviceType::CiscoIos, vec!["10.0.0.1".into()]),
            DeviceDescriptor::new("cr1", DeviceType::Juniper, vec!["10.0.0.2".into(), "10.0.1.2".into()]),
        ])
    }

    fn command(text: &str) -> Operation {
        Operation::Command {
            command: text.to_string(),
            mode: None,
        }
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_session() {
        let (manager, state) = manager();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager.execute("ar1", &command(&format!("show {i}"))).await
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            let outcome = task.await.unwrap().unwrap();
            assert_eq!(outcome, Outcome::Bytes(format!("show {i}").into_bytes()));
        }
        assert_eq!(state.connects.load(Ordering::SeqCst), 1);
        assert_eq!(state.max_in_use.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.snapshot(),
            BTreeMap::from([("ar1".to_string(), SessionState::IdleReady)])
        );
    }

    #[tokio::test]
    async fn one_transient_failure_is_absorbed() {
        let (manager, state) = manager();
        state
            .execute_script
            .lock()
            .unwrap()
            .extend([Err(AgentError::TransientIo("eof".into())), Ok(b"ok".to_vec())]);
        let outcome = manager.execute("ar1", &command("show clock")).await.unwrap();
        assert_eq!(outcome, Outcome::Bytes(b"ok".to_vec()));
        assert_eq!(state.connects.load(Ordering::SeqCst), 2);
        assert_eq!(state.executes.load(Ordering::SeqCst), 2);
        assert_eq!(manager.snapshot().get("ar1"), Some(&SessionState::IdleReady));
    }

    #[tokio::test]
    async fn second_transient_failure_surfaces_after_one_retry() {
        let (manager, state) = manager();
        state.execute_script.lock().unwrap().extend([
            Err(AgentError::TransientIo("eof".into())),
            Err(AgentError::TransientIo("eof again".into())),
        ]);
        let err = manager.execute("ar1", &command("show clock")).await.unwrap_err();
        assert_eq!(err, AgentError::TransientIo("eof again".into()));
        assert_eq!(state.connects.load(Ordering::SeqCst), 2);
        assert_eq!(state.executes.load(Ordering::SeqCst), 2);
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 2);
        assert!(manager.snapshot().is_empty());
    }

    #[tokio::test]
    async fn command_errors_keep_the_session() {
        let (manager, state) = manager();
        state
            .execute_script
            .lock()
            .unwrap()
            .push_back(Err(AgentError::Command("% Invalid input".into())));
        let err = manager.execute("ar1", &command("shwo")).await.unwrap_err();
        assert!(matches!(err, AgentError::Command(_)));
        assert_eq!(state.executes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.snapshot().get("ar1"), Some(&SessionState::IdleReady));
    }

    #[tokio::test]
    async fn addresses_are_tried_in_order_until_auth_fails() {
        let (manager, state) = manager();
        state
            .connect_script
            .lock()
            .unwrap()
            .push_back(Err(AgentError::Connect("refused".into())));
        let guard = manager.acquire("cr1").await.unwrap();
        assert_eq!(guard.address(), Some("10.0.1.2"));
        assert_eq!(guard.state(), SessionState::Busy);
        manager.release(guard);
        manager.kill_all().await;

        state.connect_script.lock().unwrap().extend([
            Err(AgentError::Auth("bad password".into())),
            Ok(()),
        ]);
        let err = manager.acquire("cr1").await.unwrap_err();
        assert!(matches!(err, AgentError::Auth(_)));
        assert_eq!(state.connects.load(Ordering::SeqCst), 3);
        assert!(manager.snapshot().is_empty());
    }

    #[tokio::test]
    async fn lookup_failures_are_classified() {
        let (manager, _) = manager_with(vec![DeviceDescriptor::new("lonely", DeviceType::CiscoIos, vec![])]);
        assert!(matches!(manager.acquire("nope").await, Err(AgentError::NotFound(_))));
        assert!(matches!(manager.acquire("lonely").await, Err(AgentError::NoAddresses(_))));

        manager.reload_credentials(CredentialStore::default()).await;
        assert!(matches!(manager.acquire("lonely").await, Err(AgentError::NoCredential(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_evicted_but_busy_ones_are_not() {
        let (manager, state) = manager();
        manager.execute("ar1", &command("show version")).await.unwrap();
        let busy = manager.acquire("cr1").await.unwrap();

        tokio::time::advance(Duration::from_secs(1000)).await;
        assert_eq!(manager.evict_idle().await, 0);

        tokio::time::advance(Duration::from_secs(801)).await;
        assert_eq!(manager.evict_idle().await, 1);
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.snapshot(),
            BTreeMap::from([("cr1".to_string(), SessionState::Busy)])
        );

        manager.release(busy);
        assert_eq!(manager.evict_idle().await, 0);
        assert_eq!(manager.snapshot().get("cr1"), Some(&SessionState::IdleReady));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_uses_per_type_idle_timeout() {
        let state = Arc::new(StubState::default());
        let inventory = Inventory::new().with_provider(
            0,
            Arc::new(StaticInventory::new(
                "test",
                vec![DeviceDescriptor::new("ar1", DeviceType::CiscoIos, vec!["a".into()])],
            )),
        );
        let config = AgentConfig::default().with_idle_timeout(DeviceType::CiscoIos, Duration::from_secs(60));
        let manager = Arc::new(SessionManager::new(
            Arc::new(config),
            Arc::new(inventory),
            credentials("secret"),
            Arc::new(StubFactory(state.clone())),
        ));
        manager.execute("ar1", &command("show version")).await.unwrap();
        let sweeper = manager.spawn_idle_sweeper(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(manager.snapshot().is_empty());
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 1);
        sweeper.abort();
    }

    #[tokio::test]
    async fn kill_all_closes_idle_and_busy_sessions() {
        let (manager, state) = manager();
        manager.execute("ar1", &command("show version")).await.unwrap();
        let busy = manager.acquire("cr1").await.unwrap();

        assert_eq!(manager.kill_all().await, 2);
        assert_eq!(
            manager.snapshot(),
            BTreeMap::from([("cr1".to_string(), SessionState::Busy)])
        );
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 1);

        drop(busy);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 2);
        assert!(manager.snapshot().is_empty());

        manager.execute("cr1", &command("show version")).await.unwrap();
        assert_eq!(state.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rotated_credentials_replace_the_session() {
        let (manager, state) = manager();
        manager.execute("ar1", &command("one")).await.unwrap();
        manager.reload_credentials(credentials("secret")).await;
        manager.execute("ar1", &command("two")).await.unwrap();
        assert_eq!(state.connects.load(Ordering::SeqCst), 1);

        manager.reload_credentials(credentials("rotated")).await;
        manager.execute("ar1", &command("three")).await.unwrap();
        assert_eq!(state.connects.load(Ordering::SeqCst), 2);
        assert_eq!(
            state.passwords.lock().unwrap().last().cloned().flatten(),
            Some("rotated".to_string())
        );
    }

    #[tokio::test]
    async fn dead_sessions_are_reconnected_before_reuse() {
        let (manager, state) = manager();
        manager.execute("ar1", &command("one")).await.unwrap();
        state.dead.store(true, Ordering::SeqCst);
        manager.execute("ar1", &command("two")).await.unwrap();
        assert_eq!(state.connects.load(Ordering::SeqCst), 2);
        assert_eq!(state.executes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn callers_after_kill_all_wait_for_the_busy_session_to_close() {
        let (manager, state) = manager();
        let busy = manager.acquire("cr1").await.unwrap();
        assert_eq!(manager.kill_all().await, 1);

        let waiter = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire("cr1").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "second caller must queue behind the killed session");
        assert_eq!(state.connects.load(Ordering::SeqCst), 1);
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 0);

        drop(busy);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.state(), SessionState::Busy);
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(state.connects.load(Ordering::SeqCst), 2);
        assert_eq!(manager.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn least_recently_used_idle_session_makes_room() {
        let mut config = AgentConfig::default();
        config.options.max_sessions = 2;
        let devices = ["ar1", "ar2", "ar3"]
            .map(|name| DeviceDescriptor::new(name, DeviceType::CiscoIos, vec!["a".into()]))
            .to_vec();
        let (manager, state) = manager_with_config(config, devices);

        manager.execute("ar1", &command("one")).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        manager.execute("ar2", &command("two")).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        manager.execute("ar1", &command("three")).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        manager.execute("ar3", &command("four")).await.unwrap();

        assert_eq!(
            manager.snapshot().into_keys().collect::<Vec<_>>(),
            ["ar1", "ar3"]
        );
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sessions_in_use_are_never_closed_to_make_room() {
        let mut config = AgentConfig::default();
        config.options.max_sessions = 1;
        let devices = ["ar1", "ar2"]
            .map(|name| DeviceDescriptor::new(name, DeviceType::CiscoIos, vec!["a".into()]))
            .to_vec();
        let (manager, state) = manager_with_config(config, devices);

        let first = manager.acquire("ar1").await.unwrap();
        let second = manager.acquire("ar2").await.unwrap();
        assert_eq!(manager.snapshot().len(), 2);
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 0);
        drop((first, second));
    }

    #[tokio::test]
    async fn session_guard_debug_names_the_device() {
        let (manager, _) = manager();
        let guard = manager.acquire("ar1").await.unwrap();
        let rendered = format!("{guard:?}");
        assert!(rendered.contains("SessionGuard"));
        assert!(rendered.contains("ar1"));
        assert!(!rendered.contains("secret"));
    }
}

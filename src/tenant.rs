use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::Config;
use crate::engine::{Engine, EngineError, LinkError, NewAppointment, NewLink, PaymentRequest};
use crate::limits::*;
use crate::model::*;

/// A visitor's booking through a public link. The customer is matched by email.
#[derive(Debug, Clone)]
pub struct PublicBooking {
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub staff_id: Ulid,
    pub service_ids: Vec<Ulid>,
    pub start: Ms,
    pub notes: Option<String>,
}

/// Routes requests to per-business engines. Each business has its own
/// Engine and WAL file `<business_id>.wal`; link tokens resolve across all.
pub struct TenantManager {
    engines: DashMap<Ulid, Arc<Engine>>,
    link_tokens: DashMap<String, Ulid>,
    data_dir: PathBuf,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

fn wal_path(data_dir: &Path, business_id: Ulid) -> PathBuf {
    data_dir.join(format!("{business_id}.wal"))
}

impl TenantManager {
    /// An empty manager. Nothing is read from `config.data_dir` until
    /// businesses are registered.
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            engines: DashMap::new(),
            link_tokens: DashMap::new(),
            data_dir: config.data_dir.clone(),
            clock,
            lock_timeout: config.lock_timeout,
        }
    }

    /// Load every `<ulid>.wal` in the data directory.
    pub fn open(config: &Config, clock: Arc<dyn Clock>) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let manager = Self::new(config, clock);

        for entry in std::fs::read_dir(&config.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wal") {
                continue;
            }
            let Some(business_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Ulid::from_string(s).ok())
            else {
                warn!(path = %path.display(), "skipping WAL with non-ULID name");
                continue;
            };
            let engine = Arc::new(Engine::open(
                business_id,
                path.clone(),
                manager.clock.clone(),
                manager.lock_timeout,
            )?);
            if engine.business().is_err() {
                warn!(path = %path.display(), "skipping WAL without a registered business");
                continue;
            }
            manager.adopt(engine);
        }

        info!(tenants = manager.engines.len(), data_dir = %config.data_dir.display(), "tenants loaded");
        Ok(manager)
    }

    fn adopt(&self, engine: Arc<Engine>) {
        for link in engine.links() {
            self.link_tokens.insert(link.token, engine.business_id);
        }
        self.engines.insert(engine.business_id, engine);
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
    }

    /// Open a new business with its own engine. `settings` default when absent;
    /// their `business_id` is replaced by the new id.
    pub async fn register_business(
        &self,
        name: String,
        email: Option<String>,
        phone: Option<String>,
        settings: Option<BusinessSettings>,
    ) -> Result<Arc<Engine>, EngineError> {
        if self.engines.len() >= MAX_TENANTS {
            return Err(EngineError::LimitExceeded("too many tenants"));
        }
        let business_id = Ulid::new();
        let path = wal_path(&self.data_dir, business_id);
        let engine = Engine::open(business_id, path.clone(), self.clock.clone(), self.lock_timeout)
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        let engine = Arc::new(engine);

        let settings = settings.map(|s| BusinessSettings { business_id, ..s });
        if let Err(e) = engine.register(name, email, phone, settings).await {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        self.adopt(engine.clone());
        Ok(engine)
    }

    pub fn engine(&self, business_id: Ulid) -> Result<Arc<Engine>, EngineError> {
        self.engines
            .get(&business_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(business_id))
    }

    pub fn engines(&self) -> Vec<Arc<Engine>> {
        self.engines.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// The engine that owns `token`. The local index is a cache: links made
    /// directly on an engine are found by asking each engine, then indexed.
    fn engine_for_token(&self, token: &str) -> Result<Arc<Engine>, EngineError> {
        if let Some(business_id) = self.link_tokens.get(token).map(|b| *b) {
            return self.engine(business_id);
        }
        let engine = self
            .engines
            .iter()
            .find(|e| e.link_by_token(token).is_ok())
            .map(|e| e.value().clone())
            .ok_or(EngineError::Link(LinkError::NotFound))?;
        self.link_tokens.insert(token.to_owned(), engine.business_id);
        Ok(engine)
    }

    // ── Booking links ────────────────────────────────────

    pub async fn create_link(
        &self,
        business_id: Ulid,
        new: NewLink,
    ) -> Result<BookingLink, EngineError> {
        let engine = self.engine(business_id)?;
        let link = engine.create_link(new).await?;
        self.link_tokens.insert(link.token.clone(), business_id);
        Ok(link)
    }

    pub fn preview_link(
        &self,
        token: &str,
        service_ids: &[Ulid],
        staff_id: Ulid,
    ) -> Result<BookingLink, EngineError> {
        self.engine_for_token(token)?
            .preview_link(token, service_ids, staff_id)
    }

    pub async fn validate_and_consume_link(
        &self,
        token: &str,
        service_ids: &[Ulid],
        staff_id: Ulid,
    ) -> Result<BookingLink, EngineError> {
        self.engine_for_token(token)?
            .validate_and_consume_link(token, service_ids, staff_id)
            .await
    }

    // ── Appointments ─────────────────────────────────────

    /// Book on behalf of `business_id`. A link token must belong to the same business.
    pub async fn create_appointment(
        &self,
        business_id: Ulid,
        req: NewAppointment,
    ) -> Result<Appointment, EngineError> {
        let engine = self.engine(business_id)?;
        if let Some(token) = &req.link_token {
            let owner = self.engine_for_token(token)?;
            if owner.business_id != business_id {
                let link = owner.link_by_token(token)?;
                return Err(EngineError::CrossTenant(link.id));
            }
        }
        engine.create_appointment(req).await
    }

    /// Self-service booking: resolve the link, upsert the customer by email,
    /// then create a pending appointment that consumes one link use.
    pub async fn book_via_link(
        &self,
        token: &str,
        booking: PublicBooking,
    ) -> Result<Appointment, EngineError> {
        let engine = self.engine_for_token(token)?;
        engine.preview_link(token, &booking.service_ids, booking.staff_id)?;
        let customer = engine
            .find_or_create_customer(booking.full_name, booking.email, booking.phone)
            .await?;
        engine
            .create_appointment(NewAppointment {
                customer_id: customer.id,
                staff_id: booking.staff_id,
                service_ids: booking.service_ids,
                start: booking.start,
                notes: booking.notes,
                link_token: Some(token.to_owned()),
            })
            .await
    }

    pub async fn transition_appointment(
        &self,
        business_id: Ulid,
        appointment_id: Ulid,
        to: AppointmentStatus,
        role: Role,
    ) -> Result<Appointment, EngineError> {
        self.engine(business_id)?
            .transition_appointment(appointment_id, to, role)
            .await
    }

    pub async fn reschedule_appointment(
        &self,
        business_id: Ulid,
        appointment_id: Ulid,
        staff_id: Ulid,
        start: Ms,
        role: Role,
    ) -> Result<Appointment, EngineError> {
        self.engine(business_id)?
            .reschedule_appointment(appointment_id, staff_id, start, role)
            .await
    }

    // ── Payments ─────────────────────────────────────────

    pub async fn record_payment(
        &self,
        business_id: Ulid,
        req: PaymentRequest,
    ) -> Result<Transaction, EngineError> {
        self.engine(business_id)?.record_payment(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{NewService, NewStaff};
    use std::fs;

    const T0: Ms = 1_780_000_000_000;

    fn test_config(name: &str) -> Config {
        let dir = std::env::temp_dir().join("agenda_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        Config::with_data_dir(dir)
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(T0))
    }

    async fn seeded(tm: &TenantManager, name: &str) -> (Arc<Engine>, Staff, Service, Customer) {
        let engine = tm
            .register_business(name.into(), None, None, None)
            .await
            .unwrap();
        let staff = engine
            .create_staff(NewStaff { name: "Selin".into(), user_id: None })
            .await
            .unwrap();
        let service = engine
            .create_service(NewService {
                name: "Cut".into(),
                duration_min: 30,
                price: 2500,
                active: true,
            })
            .await
            .unwrap();
        let customer = engine
            .create_customer("Mert".into(), Some("mert@example.com".into()), None)
            .await
            .unwrap();
        (engine, staff, service, customer)
    }

    #[tokio::test]
    async fn register_creates_wal_named_by_business() {
        let config = test_config("register");
        let tm = TenantManager::new(&config, clock());
        let engine = tm
            .register_business("Studio".into(), None, None, None)
            .await
            .unwrap();
        assert!(config.data_dir.join(format!("{}.wal", engine.business_id)).exists());
        assert!(Arc::ptr_eq(&engine, &tm.engine(engine.business_id).unwrap()));
        assert_eq!(tm.len(), 1);
    }

    #[tokio::test]
    async fn failed_registration_leaves_no_wal() {
        let config = test_config("bad_register");
        let tm = TenantManager::new(&config, clock());
        let err = tm
            .register_business("  ".into(), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(fs::read_dir(&config.data_dir).unwrap().count(), 0);
        assert!(tm.is_empty());
    }

    #[tokio::test]
    async fn unknown_business_is_not_found() {
        let tm = TenantManager::new(&test_config("unknown"), clock());
        let id = Ulid::new();
        assert!(matches!(tm.engine(id), Err(EngineError::NotFound(x)) if x == id));
    }

    #[tokio::test]
    async fn businesses_are_isolated() {
        let tm = TenantManager::new(&test_config("isolation"), clock());
        let (a, staff_a, service_a, customer_a) = seeded(&tm, "A").await;
        let (b, _, _, customer_b) = seeded(&tm, "B").await;

        // B's engine knows nothing about A's records.
        let err = b
            .create_appointment(NewAppointment {
                customer_id: customer_b.id,
                staff_id: staff_a.id,
                service_ids: vec![service_a.id],
                start: T0 + 2 * DAY_MS,
                notes: None,
                link_token: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(id) if id == staff_a.id));

        // A customer from B cannot pay in A.
        let err = a
            .record_payment(PaymentRequest {
                customer_id: customer_b.id,
                appointment_id: None,
                amount: 100,
                method: PaymentMethod::Cash,
                status: PaymentStatus::Completed,
                idempotency_key: Some("k1".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(a.customer(customer_a.id).is_ok());
    }

    #[tokio::test]
    async fn link_token_from_other_business_is_cross_tenant() {
        let tm = TenantManager::new(&test_config("cross_link"), clock());
        let (a, staff_a, service_a, customer_a) = seeded(&tm, "A").await;
        let (b, _, _, _) = seeded(&tm, "B").await;
        let link_b = tm
            .create_link(b.business_id, NewLink { name: "b".into(), active: true, ..NewLink::default() })
            .await
            .unwrap();

        let err = tm
            .create_appointment(
                a.business_id,
                NewAppointment {
                    customer_id: customer_a.id,
                    staff_id: staff_a.id,
                    service_ids: vec![service_a.id],
                    start: T0 + 2 * DAY_MS,
                    notes: None,
                    link_token: Some(link_b.token.clone()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CrossTenant(id) if id == link_b.id));
        assert_eq!(b.link(link_b.id).unwrap().current_uses, 0);
    }

    #[tokio::test]
    async fn unknown_token_is_link_not_found() {
        let tm = TenantManager::new(&test_config("no_token"), clock());
        let err = tm.preview_link("nope", &[], Ulid::new()).unwrap_err();
        assert!(matches!(err, EngineError::Link(LinkError::NotFound)));
    }

    #[tokio::test]
    async fn link_made_on_engine_resolves_through_manager() {
        let tm = TenantManager::new(&test_config("engine_link"), clock());
        let (engine, staff, service, customer) = seeded(&tm, "A").await;
        let (other, _, _, _) = seeded(&tm, "B").await;
        let link = tm
            .engine(engine.business_id)
            .unwrap()
            .create_link(NewLink { name: "direct".into(), max_uses: Some(3), active: true, ..NewLink::default() })
            .await
            .unwrap();

        assert_eq!(tm.preview_link(&link.token, &[], staff.id).unwrap().id, link.id);
        tm.validate_and_consume_link(&link.token, &[], staff.id).await.unwrap();

        let appt = tm
            .book_via_link(&link.token, PublicBooking {
                full_name: "Deniz".into(),
                email: "deniz@example.com".into(),
                phone: None,
                staff_id: staff.id,
                service_ids: vec![service.id],
                start: T0 + DAY_MS,
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(appt.link_id, Some(link.id));
        assert_eq!(engine.link(link.id).unwrap().current_uses, 2);

        // Ownership is still enforced for tokens found this way.
        let err = tm
            .create_appointment(other.business_id, NewAppointment {
                customer_id: customer.id,
                staff_id: staff.id,
                service_ids: vec![service.id],
                start: T0 + 2 * DAY_MS,
                notes: None,
                link_token: Some(link.token.clone()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CrossTenant(id) if id == link.id));
    }

    #[tokio::test]
    async fn book_via_link_upserts_customer_and_consumes() {
        let tm = TenantManager::new(&test_config("public_booking"), clock());
        let (engine, staff, service, _) = seeded(&tm, "A").await;
        let link = tm
            .create_link(
                engine.business_id,
                NewLink { name: "promo".into(), max_uses: Some(2), active: true, ..NewLink::default() },
            )
            .await
            .unwrap();

        let booking = |start| PublicBooking {
            full_name: "Zeynep".into(),
            email: "Zeynep@Example.com".into(),
            phone: None,
            staff_id: staff.id,
            service_ids: vec![service.id],
            start,
            notes: None,
        };
        let first = tm.book_via_link(&link.token, booking(T0 + DAY_MS)).await.unwrap();
        let second = tm
            .book_via_link(&link.token, booking(T0 + DAY_MS + 2 * HOUR_MS))
            .await
            .unwrap();
        assert_eq!(first.status, AppointmentStatus::Pending);
        assert_eq!(first.customer_id, second.customer_id);
        assert_eq!(engine.link(link.id).unwrap().current_uses, 2);

        let err = tm
            .book_via_link(&link.token, booking(T0 + DAY_MS + 4 * HOUR_MS))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Link(LinkError::Exhausted)));
    }

    #[tokio::test]
    async fn open_reloads_businesses_and_tokens() {
        let config = test_config("reopen");
        let (business_id, token) = {
            let tm = TenantManager::new(&config, clock());
            let (engine, _, _, _) = seeded(&tm, "A").await;
            let link = tm
                .create_link(engine.business_id, NewLink { name: "x".into(), active: true, ..NewLink::default() })
                .await
                .unwrap();
            (engine.business_id, link.token)
        };
        // Stray files are ignored.
        fs::write(config.data_dir.join("notes.txt"), b"hi").unwrap();
        fs::write(config.data_dir.join("not-a-ulid.wal"), b"").unwrap();

        let tm = TenantManager::open(&config, clock()).unwrap();
        assert_eq!(tm.len(), 1);
        let engine = tm.engine(business_id).unwrap();
        assert_eq!(engine.business().unwrap().name, "A");
        assert_eq!(engine.services().len(), 1);
        assert!(tm.preview_link(&token, &[], engine.staff_members()[0].id).is_ok());
    }
}

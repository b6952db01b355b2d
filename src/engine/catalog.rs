use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::normalize_email;
use super::{Engine, EngineError};

#[derive(Debug, Clone)]
pub struct NewService {
    pub name: String,
    pub duration_min: u32,
    pub price: Cents,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct NewStaff {
    pub name: String,
    pub user_id: Option<Ulid>,
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_contact(value: &Option<String>) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded("contact too long")),
        _ => Ok(()),
    }
}

pub(crate) fn validate_settings(settings: &BusinessSettings) -> Result<(), EngineError> {
    if settings.slot_length_min == 0 || settings.slot_length_min > MAX_SERVICE_DURATION_MIN {
        return Err(EngineError::Validation("slot length must be 1..=1440 minutes"));
    }
    if settings.buffer_time_min > MAX_BUFFER_MIN {
        return Err(EngineError::LimitExceeded("buffer too long"));
    }
    if settings.cancellation_hours > MAX_CANCELLATION_HOURS {
        return Err(EngineError::LimitExceeded("cancellation window too long"));
    }
    if settings.working_hours_start >= settings.working_hours_end {
        return Err(EngineError::Validation("working hours must end after they start"));
    }
    if settings.utc_offset_min.abs() > MAX_UTC_OFFSET_MIN {
        return Err(EngineError::Validation("utc offset out of range"));
    }
    if settings.timezone.is_empty() || settings.timezone.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation("timezone label must be 1..=256 bytes"));
    }
    Ok(())
}

fn validate_service_fields(name: &str, duration_min: u32, price: Cents) -> Result<(), EngineError> {
    validate_name(name)?;
    if duration_min == 0 {
        return Err(EngineError::Validation("service duration must be positive"));
    }
    if duration_min > MAX_SERVICE_DURATION_MIN {
        return Err(EngineError::LimitExceeded("service too long"));
    }
    if !(0..=MAX_AMOUNT_CENTS).contains(&price) {
        return Err(EngineError::Validation("price out of range"));
    }
    Ok(())
}

impl Engine {
    // ── Business ─────────────────────────────────────────

    /// Write the business record and its initial settings.
    pub async fn register(
        &self,
        name: String,
        email: Option<String>,
        phone: Option<String>,
        settings: Option<BusinessSettings>,
    ) -> Result<Business, EngineError> {
        validate_name(&name)?;
        validate_contact(&email)?;
        validate_contact(&phone)?;
        let settings = settings.unwrap_or_else(|| BusinessSettings::defaults_for(self.business_id));
        self.ensure_owned(settings.business_id, settings.business_id)?;
        validate_settings(&settings)?;

        let _catalog = self.catalog_lock.lock().await;
        if self.store.business.contains_key(&self.business_id) {
            return Err(EngineError::AlreadyExists(self.business_id));
        }
        let business = Business {
            id: self.business_id,
            name,
            email,
            phone,
        };
        self.persist_and_apply(Event::BusinessRegistered {
            business: business.clone(),
            settings,
        })
        .await?;
        info!(business_id = %self.business_id, name = %business.name, "business registered");
        Ok(business)
    }

    pub fn business(&self) -> Result<Business, EngineError> {
        self.store
            .business
            .get(&self.business_id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(self.business_id))
    }

    pub fn settings(&self) -> Result<BusinessSettings, EngineError> {
        self.store
            .settings
            .get(&self.business_id)
            .map(|s| s.clone())
            .ok_or(EngineError::NotFound(self.business_id))
    }

    /// Replace the settings. Existing appointments keep their times; the new
    /// buffer applies to every check from now on.
    pub async fn update_settings(
        &self,
        settings: BusinessSettings,
    ) -> Result<BusinessSettings, EngineError> {
        self.ensure_owned(settings.business_id, settings.business_id)?;
        validate_settings(&settings)?;
        self.business()?;
        self.persist_and_apply(Event::SettingsUpdated {
            settings: settings.clone(),
        })
        .await?;
        Ok(settings)
    }

    // ── Services ─────────────────────────────────────────

    fn service_name_taken(&self, name: &str, except: Option<Ulid>) -> Option<Ulid> {
        let name = name.trim();
        self.store
            .services
            .iter()
            .find(|s| Some(s.id) != except && s.name.trim().eq_ignore_ascii_case(name))
            .map(|s| s.id)
    }

    pub async fn create_service(&self, new: NewService) -> Result<Service, EngineError> {
        validate_service_fields(&new.name, new.duration_min, new.price)?;
        let _catalog = self.catalog_lock.lock().await;
        if let Some(existing) = self.service_name_taken(&new.name, None) {
            return Err(EngineError::AlreadyExists(existing));
        }
        let service = Service {
            id: Ulid::new(),
            business_id: self.business_id,
            name: new.name,
            duration_min: new.duration_min,
            price: new.price,
            active: new.active,
        };
        self.persist_and_apply(Event::ServiceSaved {
            service: service.clone(),
        })
        .await?;
        Ok(service)
    }

    /// Price and duration changes do not touch existing appointments, which
    /// carry their own snapshot.
    pub async fn update_service(&self, service: Service) -> Result<Service, EngineError> {
        validate_service_fields(&service.name, service.duration_min, service.price)?;
        self.owned_service(service.id)?;
        self.ensure_owned(service.business_id, service.id)?;
        let _catalog = self.catalog_lock.lock().await;
        if let Some(existing) = self.service_name_taken(&service.name, Some(service.id)) {
            return Err(EngineError::AlreadyExists(existing));
        }
        self.persist_and_apply(Event::ServiceSaved {
            service: service.clone(),
        })
        .await?;
        Ok(service)
    }

    pub(super) fn owned_service(&self, id: Ulid) -> Result<Service, EngineError> {
        let service = self
            .store
            .services
            .get(&id)
            .map(|s| s.clone())
            .ok_or(EngineError::NotFound(id))?;
        self.ensure_owned(service.business_id, id)?;
        Ok(service)
    }

    pub fn service(&self, id: Ulid) -> Result<Service, EngineError> {
        self.owned_service(id)
    }

    pub fn services(&self) -> Vec<Service> {
        let mut all: Vec<Service> = self.store.services.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    // ── Staff ────────────────────────────────────────────

    pub async fn create_staff(&self, new: NewStaff) -> Result<Staff, EngineError> {
        validate_name(&new.name)?;
        let staff = Staff {
            id: Ulid::new(),
            business_id: self.business_id,
            name: new.name,
            user_id: new.user_id,
            active: true,
        };
        self.persist_and_apply(Event::StaffSaved {
            staff: staff.clone(),
        })
        .await?;
        Ok(staff)
    }

    /// Deactivated staff keep their appointments but accept no new ones.
    pub async fn update_staff(&self, staff: Staff) -> Result<Staff, EngineError> {
        validate_name(&staff.name)?;
        self.owned_staff(staff.id)?;
        self.ensure_owned(staff.business_id, staff.id)?;
        self.persist_and_apply(Event::StaffSaved {
            staff: staff.clone(),
        })
        .await?;
        Ok(staff)
    }

    pub(super) fn owned_staff(&self, id: Ulid) -> Result<Staff, EngineError> {
        let staff = self
            .store
            .staff
            .get(&id)
            .map(|s| s.clone())
            .ok_or(EngineError::NotFound(id))?;
        self.ensure_owned(staff.business_id, id)?;
        Ok(staff)
    }

    pub fn staff(&self, id: Ulid) -> Result<Staff, EngineError> {
        self.owned_staff(id)
    }

    pub fn staff_members(&self) -> Vec<Staff> {
        let mut all: Vec<Staff> = self.store.staff.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    // ── Customers ────────────────────────────────────────

    pub async fn create_customer(
        &self,
        full_name: String,
        email: Option<String>,
        phone: Option<String>,
    ) -> Result<Customer, EngineError> {
        validate_name(&full_name)?;
        validate_contact(&email)?;
        validate_contact(&phone)?;
        let _catalog = self.catalog_lock.lock().await;
        if let Some(email) = &email
            && let Some(existing) = self.store.customer_emails.get(&normalize_email(email))
        {
            return Err(EngineError::AlreadyExists(*existing));
        }
        let customer = Customer {
            id: Ulid::new(),
            business_id: self.business_id,
            full_name,
            email,
            phone,
        };
        self.persist_and_apply(Event::CustomerSaved {
            customer: customer.clone(),
        })
        .await?;
        Ok(customer)
    }

    /// Look a customer up by email, refreshing name and phone, or create one.
    /// Used by public bookings, where the visitor identifies only by contact.
    pub async fn find_or_create_customer(
        &self,
        full_name: String,
        email: String,
        phone: Option<String>,
    ) -> Result<Customer, EngineError> {
        validate_name(&full_name)?;
        if email.trim().is_empty() {
            return Err(EngineError::Validation("email must not be empty"));
        }
        validate_contact(&Some(email.clone()))?;
        validate_contact(&phone)?;

        let _catalog = self.catalog_lock.lock().await;
        let existing = self
            .store
            .customer_emails
            .get(&normalize_email(&email))
            .map(|id| *id);
        let customer = match existing.and_then(|id| self.store.customers.get(&id).map(|c| c.clone())) {
            Some(mut c) => {
                if c.full_name == full_name && (phone.is_none() || c.phone == phone) {
                    return Ok(c);
                }
                c.full_name = full_name;
                if phone.is_some() {
                    c.phone = phone;
                }
                c
            }
            None => Customer {
                id: Ulid::new(),
                business_id: self.business_id,
                full_name,
                email: Some(email),
                phone,
            },
        };
        self.persist_and_apply(Event::CustomerSaved {
            customer: customer.clone(),
        })
        .await?;
        Ok(customer)
    }

    pub(super) fn owned_customer(&self, id: Ulid) -> Result<Customer, EngineError> {
        let customer = self
            .store
            .customers
            .get(&id)
            .map(|c| c.clone())
            .ok_or(EngineError::NotFound(id))?;
        self.ensure_owned(customer.business_id, id)?;
        Ok(customer)
    }

    pub fn customer(&self, id: Ulid) -> Result<Customer, EngineError> {
        self.owned_customer(id)
    }
}

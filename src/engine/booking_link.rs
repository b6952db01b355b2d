use std::sync::Arc;

use chrono::NaiveDate;
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::LINK_REJECTIONS_TOTAL;

use super::{Engine, EngineError, LinkError, detach};

#[derive(Debug, Clone, Default)]
pub struct NewLink {
    pub name: String,
    pub service_ids: Option<Vec<Ulid>>,
    pub staff_ids: Option<Vec<Ulid>>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub max_uses: Option<u32>,
    pub active: bool,
}

/// Decide whether `link` admits a booking of `service_ids` with `staff_id` on
/// local day `today`. Checks run in a fixed order and stop at the first failure.
pub fn check_link(
    link: &BookingLink,
    service_ids: &[Ulid],
    staff_id: Ulid,
    today: NaiveDate,
) -> Result<(), LinkError> {
    if !link.active {
        return Err(LinkError::Inactive);
    }
    if link.start_date.is_some_and(|d| today < d) {
        return Err(LinkError::NotYetActive);
    }
    if link.end_date.is_some_and(|d| today > d) {
        return Err(LinkError::Expired);
    }
    if link.max_uses.is_some_and(|max| link.current_uses >= max) {
        return Err(LinkError::Exhausted);
    }
    if let Some(allowed) = &link.service_ids
        && let Some(&denied) = service_ids.iter().find(|id| !allowed.contains(id))
    {
        return Err(LinkError::ServiceNotAllowed(denied));
    }
    if let Some(allowed) = &link.staff_ids
        && !allowed.contains(&staff_id)
    {
        return Err(LinkError::StaffNotAllowed(staff_id));
    }
    Ok(())
}

pub(crate) fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(LINK_TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn record_rejection(err: &LinkError) {
    metrics::counter!(LINK_REJECTIONS_TOTAL, "reason" => err.reason()).increment(1);
}

impl Engine {
    fn validate_link_fields(
        &self,
        name: &str,
        service_ids: &Option<Vec<Ulid>>,
        staff_ids: &Option<Vec<Ulid>>,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
        max_uses: Option<u32>,
    ) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("link name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("link name too long"));
        }
        if let (Some(from), Some(until)) = (start_date, end_date)
            && from > until
        {
            return Err(EngineError::Validation("link window ends before it starts"));
        }
        if max_uses == Some(0) {
            return Err(EngineError::Validation("max uses must be positive"));
        }
        if let Some(ids) = service_ids {
            if ids.len() > MAX_LINK_ALLOW_LIST {
                return Err(EngineError::LimitExceeded("service allow-list too long"));
            }
            for id in ids {
                self.owned_service(*id)?;
            }
        }
        if let Some(ids) = staff_ids {
            if ids.len() > MAX_LINK_ALLOW_LIST {
                return Err(EngineError::LimitExceeded("staff allow-list too long"));
            }
            for id in ids {
                self.owned_staff(*id)?;
            }
        }
        Ok(())
    }

    pub async fn create_link(&self, new: NewLink) -> Result<BookingLink, EngineError> {
        self.validate_link_fields(
            &new.name,
            &new.service_ids,
            &new.staff_ids,
            new.start_date,
            new.end_date,
            new.max_uses,
        )?;
        let mut token = generate_token();
        while self.store.link_tokens.contains_key(&token) {
            token = generate_token();
        }
        let link = BookingLink {
            id: Ulid::new(),
            business_id: self.business_id,
            token,
            name: new.name,
            service_ids: new.service_ids,
            staff_ids: new.staff_ids,
            start_date: new.start_date,
            end_date: new.end_date,
            max_uses: new.max_uses,
            current_uses: 0,
            active: new.active,
        };
        self.persist_and_apply(Event::LinkSaved { link: link.clone() })
            .await?;
        info!(link_id = %link.id, name = %link.name, "booking link created");
        Ok(link)
    }

    /// Replace a link's settings. Token and use count are kept from the stored link.
    pub async fn update_link(&self, update: BookingLink) -> Result<BookingLink, EngineError> {
        self.ensure_owned(update.business_id, update.id)?;
        self.validate_link_fields(
            &update.name,
            &update.service_ids,
            &update.staff_ids,
            update.start_date,
            update.end_date,
            update.max_uses,
        )?;
        self.owned_link(update.id)?;
        let _link = self.lock_link(update.id).await?;
        let current = self.owned_link(update.id)?;
        if update.max_uses.is_some_and(|max| max < current.current_uses) {
            return Err(EngineError::Validation("max uses below uses already taken"));
        }
        let link = BookingLink {
            token: current.token,
            current_uses: current.current_uses,
            ..update
        };
        self.persist_and_apply(Event::LinkSaved { link: link.clone() })
            .await?;
        Ok(link)
    }

    fn owned_link(&self, id: Ulid) -> Result<BookingLink, EngineError> {
        let link = self
            .store
            .links
            .get(&id)
            .map(|l| l.clone())
            .ok_or(EngineError::NotFound(id))?;
        self.ensure_owned(link.business_id, id)?;
        Ok(link)
    }

    pub fn link(&self, id: Ulid) -> Result<BookingLink, EngineError> {
        self.owned_link(id)
    }

    pub fn links(&self) -> Vec<BookingLink> {
        self.store.links.iter().map(|l| l.clone()).collect()
    }

    /// Resolve a token to its link. Unknown tokens are `Link(NotFound)`.
    pub fn link_by_token(&self, token: &str) -> Result<BookingLink, EngineError> {
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(LinkError::NotFound.into());
        }
        let id = self
            .store
            .link_tokens
            .get(token)
            .map(|id| *id)
            .ok_or(EngineError::Link(LinkError::NotFound))?;
        self.owned_link(id)
    }

    /// Per-link mutex, bounded by the engine's lock timeout.
    pub(super) async fn lock_link(&self, link_id: Ulid) -> Result<OwnedMutexGuard<()>, EngineError> {
        let mutex = self
            .link_locks
            .entry(link_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        tokio::time::timeout(self.lock_timeout, mutex.lock_owned())
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                warn!(link_id = %link_id, "booking link lock wait timed out");
                EngineError::LockTimeout
            })
    }

    /// Run [`check_link`] against the business's current local day.
    pub(super) fn check_link_now(
        &self,
        link: &BookingLink,
        service_ids: &[Ulid],
        staff_id: Ulid,
    ) -> Result<(), EngineError> {
        let settings = self.settings()?;
        let today = local_day(self.now_ms(), settings.utc_offset_min);
        check_link(link, service_ids, staff_id, today).map_err(|e| {
            record_rejection(&e);
            EngineError::Link(e)
        })
    }

    /// Validate without consuming.
    pub fn preview_link(
        &self,
        token: &str,
        service_ids: &[Ulid],
        staff_id: Ulid,
    ) -> Result<BookingLink, EngineError> {
        let link = self.link_by_token(token).inspect_err(|e| {
            if let EngineError::Link(le) = e {
                record_rejection(le);
            }
        })?;
        self.check_link_now(&link, service_ids, staff_id)?;
        Ok(link)
    }

    /// Validate and take one use of the link, outside any appointment.
    pub async fn validate_and_consume_link(
        self: &Arc<Self>,
        token: &str,
        service_ids: &[Ulid],
        staff_id: Ulid,
    ) -> Result<BookingLink, EngineError> {
        let this = Arc::clone(self);
        let token = token.to_owned();
        let service_ids = service_ids.to_vec();
        detach(async move { this.consume_link_locked(&token, &service_ids, staff_id).await }).await
    }

    async fn consume_link_locked(
        &self,
        token: &str,
        service_ids: &[Ulid],
        staff_id: Ulid,
    ) -> Result<BookingLink, EngineError> {
        let link = self.preview_link(token, service_ids, staff_id)?;
        let _link_guard = self.lock_link(link.id).await?;
        // Re-read under the lock; a concurrent redemption may have taken the last use.
        let mut link = self.owned_link(link.id)?;
        self.check_link_now(&link, service_ids, staff_id)?;

        self.persist_and_apply(Event::LinkRedeemed { link_id: link.id })
            .await?;
        link.current_uses += 1;
        info!(link_id = %link.id, uses = link.current_uses, "booking link redeemed");
        Ok(link)
    }
}

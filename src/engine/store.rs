use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// One active appointment's raw (unpadded) occupation of its staff member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Booked {
    pub appointment_id: Ulid,
    pub span: Span,
}

/// Active appointments of one staff member, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct StaffSchedule {
    pub entries: Vec<Booked>,
}

impl StaffSchedule {
    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, booked: Booked) {
        let pos = self
            .entries
            .binary_search_by_key(&booked.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, booked);
    }

    pub fn remove(&mut self, appointment_id: Ulid) -> Option<Booked> {
        let pos = self
            .entries
            .iter()
            .position(|b| b.appointment_id == appointment_id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booked> {
        let right_bound = self.entries.partition_point(|b| b.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// All state of one business, rebuilt from its WAL.
///
/// Every map is keyed by entity id; the secondary indexes back the uniqueness
/// invariants (staff start instant, customer email, link token, payment
/// dedup key, idempotency key).
pub struct Store {
    pub business_id: Ulid,
    pub business: DashMap<Ulid, Business>,
    pub settings: DashMap<Ulid, BusinessSettings>,
    pub services: DashMap<Ulid, Service>,
    pub staff: DashMap<Ulid, Staff>,
    pub customers: DashMap<Ulid, Customer>,
    pub customer_emails: DashMap<String, Ulid>,
    pub appointments: DashMap<Ulid, Appointment>,
    /// (staff, start) → appointment. Covers every status.
    pub starts: DashMap<(Ulid, Ms), Ulid>,
    pub schedules: DashMap<Ulid, StaffSchedule>,
    pub links: DashMap<Ulid, BookingLink>,
    pub link_tokens: DashMap<String, Ulid>,
    pub transactions: DashMap<Ulid, Transaction>,
    pub payment_keys: DashMap<PaymentKey, Ulid>,
    pub idempotency_keys: DashMap<String, Ulid>,
    pub appointment_payments: DashMap<Ulid, Vec<Ulid>>,
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl Store {
    pub fn new(business_id: Ulid) -> Self {
        Self {
            business_id,
            business: DashMap::new(),
            settings: DashMap::new(),
            services: DashMap::new(),
            staff: DashMap::new(),
            customers: DashMap::new(),
            customer_emails: DashMap::new(),
            appointments: DashMap::new(),
            starts: DashMap::new(),
            schedules: DashMap::new(),
            links: DashMap::new(),
            link_tokens: DashMap::new(),
            transactions: DashMap::new(),
            payment_keys: DashMap::new(),
            idempotency_keys: DashMap::new(),
            appointment_payments: DashMap::new(),
        }
    }

    fn schedule_insert(&self, appointment: &Appointment) {
        if !appointment.status.occupies_slot() || appointment.lines.is_empty() {
            return;
        }
        self.schedules
            .entry(appointment.staff_id)
            .or_default()
            .insert(Booked {
                appointment_id: appointment.id,
                span: appointment.span(),
            });
    }

    fn schedule_remove(&self, staff_id: Ulid, appointment_id: Ulid) {
        if let Some(mut schedule) = self.schedules.get_mut(&staff_id) {
            schedule.remove(appointment_id);
        }
    }

    fn bump_link_uses(&self, link_id: Ulid) {
        if let Some(mut link) = self.links.get_mut(&link_id) {
            link.current_uses += 1;
        }
    }

    /// Apply one event. The caller has already validated it and made it durable.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::BusinessRegistered { business, settings } => {
                self.business.insert(business.id, business.clone());
                self.settings.insert(settings.business_id, settings.clone());
            }
            Event::SettingsUpdated { settings } => {
                self.settings.insert(settings.business_id, settings.clone());
            }
            Event::ServiceSaved { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::StaffSaved { staff } => {
                self.schedules.entry(staff.id).or_default();
                self.staff.insert(staff.id, staff.clone());
            }
            Event::CustomerSaved { customer } => {
                let previous = self
                    .customers
                    .insert(customer.id, customer.clone())
                    .and_then(|old| old.email);
                if let Some(old) = previous {
                    self.customer_emails.remove(&normalize_email(&old));
                }
                if let Some(email) = &customer.email {
                    self.customer_emails.insert(normalize_email(email), customer.id);
                }
            }
            Event::LinkSaved { link } => {
                if let Some(old) = self.links.insert(link.id, link.clone())
                    && old.token != link.token
                {
                    self.link_tokens.remove(&old.token);
                }
                self.link_tokens.insert(link.token.clone(), link.id);
            }
            Event::LinkRedeemed { link_id } => self.bump_link_uses(*link_id),
            Event::AppointmentCreated {
                appointment,
                consumed_link,
            } => {
                self.starts
                    .insert((appointment.staff_id, appointment.start), appointment.id);
                self.schedule_insert(appointment);
                self.appointments.insert(appointment.id, appointment.clone());
                if let Some(link_id) = consumed_link {
                    self.bump_link_uses(*link_id);
                }
            }
            Event::AppointmentStatusChanged { id, status } => {
                let staff_id = match self.appointments.get_mut(id) {
                    Some(mut appt) => {
                        appt.status = *status;
                        appt.staff_id
                    }
                    None => return,
                };
                if !status.occupies_slot() {
                    self.schedule_remove(staff_id, *id);
                }
            }
            Event::AppointmentRescheduled { id, staff_id, start } => {
                let moved = match self.appointments.get_mut(id) {
                    Some(mut appt) => {
                        let old = (appt.staff_id, appt.start);
                        appt.staff_id = *staff_id;
                        appt.start = *start;
                        Some((old, appt.clone()))
                    }
                    None => None,
                };
                if let Some(((old_staff, old_start), appt)) = moved {
                    self.starts.remove(&(old_staff, old_start));
                    self.schedule_remove(old_staff, *id);
                    self.starts.insert((appt.staff_id, appt.start), appt.id);
                    self.schedule_insert(&appt);
                }
            }
            Event::TransactionRecorded { transaction } => {
                if let Some(key) = transaction.payment_key() {
                    self.payment_keys.insert(key, transaction.id);
                }
                if let Some(k) = &transaction.idempotency_key {
                    self.idempotency_keys.insert(k.clone(), transaction.id);
                }
                if let Some(appt_id) = transaction.appointment_id {
                    self.appointment_payments
                        .entry(appt_id)
                        .or_default()
                        .push(transaction.id);
                }
                self.transactions.insert(transaction.id, transaction.clone());
            }
        }
    }

    /// Minimal event list recreating the current state. Link use counts are
    /// carried by `LinkSaved`, so appointments are re-emitted without consuming.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();

        if let (Some(business), Some(settings)) = (
            self.business.get(&self.business_id).map(|b| b.clone()),
            self.settings.get(&self.business_id).map(|s| s.clone()),
        ) {
            events.push(Event::BusinessRegistered { business, settings });
        } else if let Some(settings) = self.settings.get(&self.business_id) {
            events.push(Event::SettingsUpdated {
                settings: settings.clone(),
            });
        }

        events.extend(self.services.iter().map(|s| Event::ServiceSaved {
            service: s.value().clone(),
        }));
        events.extend(self.staff.iter().map(|s| Event::StaffSaved {
            staff: s.value().clone(),
        }));
        events.extend(self.customers.iter().map(|c| Event::CustomerSaved {
            customer: c.value().clone(),
        }));
        events.extend(self.links.iter().map(|l| Event::LinkSaved {
            link: l.value().clone(),
        }));

        let mut appointments: Vec<Appointment> =
            self.appointments.iter().map(|a| a.value().clone()).collect();
        appointments.sort_by_key(|a| a.id);
        events.extend(appointments.into_iter().map(|appointment| {
            Event::AppointmentCreated {
                appointment,
                consumed_link: None,
            }
        }));

        let mut transactions: Vec<Transaction> =
            self.transactions.iter().map(|t| t.value().clone()).collect();
        transactions.sort_by_key(|t| t.id);
        events.extend(
            transactions
                .into_iter()
                .map(|transaction| Event::TransactionRecorded { transaction }),
        );

        events
    }
}

/// The business an event's payload claims to belong to.
pub(crate) fn event_business_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BusinessRegistered { business, .. } => Some(business.id),
        Event::SettingsUpdated { settings } => Some(settings.business_id),
        Event::ServiceSaved { service } => Some(service.business_id),
        Event::StaffSaved { staff } => Some(staff.business_id),
        Event::CustomerSaved { customer } => Some(customer.business_id),
        Event::LinkSaved { link } => Some(link.business_id),
        Event::AppointmentCreated { appointment, .. } => Some(appointment.business_id),
        Event::TransactionRecorded { transaction } => Some(transaction.business_id),
        Event::LinkRedeemed { .. }
        | Event::AppointmentStatusChanged { .. }
        | Event::AppointmentRescheduled { .. } => None,
    }
}

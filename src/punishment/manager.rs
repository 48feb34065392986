//! Punishment lifecycle manager
//!
//! Orchestrates apply/renew/cancel/expire on top of the store and the
//! scheduler, and reconciles internal state with the live role and
//! membership state of the platform. All mutations for a given
//! (guild, member) key are serialized through a per-key mutex; operations
//! on different keys interleave freely.

use crate::punishment::duration::render_duration;
use crate::punishment::error::{PlatformError, PunishError, PunishResult};
use crate::punishment::outcome::PunishOutcome;
use crate::punishment::platform::{ModLog, Platform};
use crate::punishment::record::{PunishKey, PunishmentRecord};
use crate::punishment::scheduler::{ExpirationScheduler, deadline_from_until};
use crate::punishment::store::PunishmentStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Source of the current wall-clock time; swapped out in tests so expiry
/// revalidation follows the tokio clock.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Moderation-log cases are only opened for punishments at least this
/// long (or indefinite); short timeouts stay out of the case log.
pub const CASE_MIN_SECONDS: u64 = 30 * 60;

const ACTION_STR: &str = "Timed mute";

/// Sole writer of punishment state
pub struct PunishmentManager {
    store: PunishmentStore,
    scheduler: Arc<ExpirationScheduler>,
    platform: Arc<dyn Platform>,
    modlog: Option<Arc<dyn ModLog>>,
    locks: DashMap<PunishKey, Arc<Mutex<()>>>,
    clock: Clock,
}

impl PunishmentManager {
    /// Build a manager over a pre-loaded store. The moderation log is
    /// resolved once here, never looked up per call.
    #[must_use]
    pub fn new(
        store: PunishmentStore,
        scheduler: Arc<ExpirationScheduler>,
        platform: Arc<dyn Platform>,
        modlog: Option<Arc<dyn ModLog>>,
    ) -> Self {
        Self {
            store,
            scheduler,
            platform,
            modlog,
            locks: DashMap::new(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Wire the scheduler's fire callback to [`Self::expire`]
    pub fn install_callback(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.scheduler.set_callback(Arc::new(move |key| {
            let manager = Arc::clone(&manager);
            Box::pin(async move { manager.expire(key).await })
        }));
    }

    /// Apply a new punishment or renew an existing one.
    ///
    /// `duration` is in seconds; None means indefinite (no auto-expiry).
    ///
    /// # Errors
    /// Fails on hierarchy refusal, a missing or unmanageable restriction
    /// role, or a platform failure while applying the role. In the error
    /// case no record is left behind.
    pub async fn punish(
        &self,
        guild_id: u64,
        user_id: u64,
        moderator_id: u64,
        duration: Option<u64>,
        reason: Option<String>,
    ) -> PunishResult<PunishOutcome> {
        if user_id == moderator_id {
            return Err(PunishError::HierarchyDenied(
                "you cannot punish yourself".to_string(),
            ));
        }
        if !self
            .platform
            .can_moderate(guild_id, moderator_id, user_id)
            .await
        {
            return Err(PunishError::HierarchyDenied(
                "the target is at or above your privilege level".to_string(),
            ));
        }

        let role_id = self
            .platform
            .restriction_role(guild_id)
            .ok_or(PunishError::RoleNotConfigured(guild_id))?;
        if !self.platform.role_manageable(guild_id, role_id).await {
            return Err(PunishError::RoleUnmanageable(role_id));
        }

        let key = PunishKey::new(guild_id, user_id);
        let _guard = self.key_guard(key).await;

        let outcome = match self.store.get(key) {
            Some(mut record) => {
                record.renew(moderator_id, duration, reason.clone());
                // Re-apply the role if it was stripped externally
                if !self.platform.has_role(guild_id, user_id, role_id).await? {
                    self.platform.add_role(guild_id, user_id, role_id).await?;
                }
                let start = record.start;
                let until = record.until;
                self.note_case(
                    guild_id,
                    &record,
                    &format!("Renewed: now {}", describe_expiry(until)),
                )
                .await;
                self.store.put(key, record);
                self.update_schedule(key, until);
                info!(%key, moderator_id, ?until, "Punishment renewed");
                PunishOutcome::Renewed { start, until }
            }
            None => {
                let mut record = PunishmentRecord::new(moderator_id, duration, reason.clone());
                self.platform.add_role(guild_id, user_id, role_id).await?;

                // Voice mute only lands while the member is in voice; the
                // unmute owed at the end is tracked on the record.
                match self.platform.set_voice_mute(guild_id, user_id, true).await {
                    Ok(()) => record.unmute_pending = true,
                    Err(PlatformError::NoVoiceSession(_)) => {}
                    Err(e) => warn!(%key, error = %e, "Voice mute failed"),
                }

                if let Some(modlog) = &self.modlog {
                    if duration.is_none_or(|secs| secs >= CASE_MIN_SECONDS) {
                        match modlog
                            .open_case(guild_id, user_id, moderator_id, ACTION_STR, reason.as_deref())
                            .await
                        {
                            Ok(case_ref) => record.case_ref = Some(case_ref),
                            Err(e) => warn!(%key, error = %e, "Could not open moderation-log case"),
                        }
                    }
                }

                let until = record.until;
                self.store.put(key, record);
                self.update_schedule(key, until);
                info!(%key, moderator_id, ?until, "Punishment applied");
                PunishOutcome::Applied { until }
            }
        };

        self.persist().await;

        let text = match duration {
            Some(secs) => format!(
                "You have been muted for {}.",
                render_duration(secs as i64, false)
            ),
            None => "You have been muted indefinitely.".to_string(),
        };
        self.platform.send_direct_message(user_id, &text).await;

        Ok(outcome)
    }

    /// Lift a punishment early. Returns false, without any platform call,
    /// when there is no record for the member (nothing to do).
    ///
    /// # Errors
    /// Fails only if the platform refuses to remove the role; the record
    /// and scheduler entry then stay in place for a later retry.
    pub async fn unpunish(
        &self,
        guild_id: u64,
        user_id: u64,
        reason: Option<&str>,
        actor_id: u64,
    ) -> PunishResult<bool> {
        let key = PunishKey::new(guild_id, user_id);
        let _guard = self.key_guard(key).await;

        let Some(record) = self.store.get(key) else {
            return Ok(false);
        };

        if let Some(role_id) = self.platform.restriction_role(guild_id) {
            self.platform.remove_role(guild_id, user_id, role_id).await?;
        }
        self.scheduler.cancel(key);
        if record.unmute_pending {
            if let Err(e) = self.platform.set_voice_mute(guild_id, user_id, false).await {
                debug!(%key, error = %e, "Voice unmute deferred until the member reappears in voice");
                self.store.add_pending_unmute(key);
            }
        }
        self.store.delete(key);
        self.persist().await;

        let mut note = format!("Manually unpunished by <@{actor_id}>");
        if let Some(remaining) = record.remaining_seconds() {
            note.push_str(&format!(
                " with {} remaining",
                render_duration(remaining.max(0), false)
            ));
        }
        if let Some(reason) = reason {
            note.push_str(&format!(": {reason}"));
        }
        self.note_case(guild_id, &record, &note).await;

        self.platform
            .send_direct_message(user_id, "Your mute has been lifted early.")
            .await;

        info!(%key, actor_id, "Punishment lifted");
        drop(_guard);
        self.prune_lock(key);
        Ok(true)
    }

    /// Scheduler callback: remove an expired punishment.
    ///
    /// Revalidates against the store first; a fire for a missing or
    /// not-yet-due record is a stale entry and is ignored (an undue record
    /// is simply re-armed from its authoritative expiry). The returned
    /// bool reports whether the member could be notified and is used for
    /// diagnostics only.
    pub async fn expire(&self, key: PunishKey) -> bool {
        let _guard = self.key_guard(key).await;

        let Some(record) = self.store.get(key) else {
            debug!(%key, "Stale expiration fire, no record");
            return true;
        };
        match record.until {
            None => {
                debug!(%key, "Stale expiration fire for an indefinite punishment");
                return true;
            }
            Some(until) if until > (self.clock)() => {
                // The record was renewed since this entry was armed;
                // re-derive the deadline from the store.
                self.scheduler.rearm(self.deadline(until), key);
                return true;
            }
            Some(_) => {}
        }

        if let Some(role_id) = self.platform.restriction_role(key.guild_id) {
            if let Err(e) = self
                .platform
                .remove_role(key.guild_id, key.user_id, role_id)
                .await
            {
                // Keep the record; reconciliation on the next triggering
                // event or startup heals the drift.
                warn!(%key, error = %e, "Could not remove restriction role on expiry");
                return false;
            }
        }
        if record.unmute_pending {
            if let Err(e) = self
                .platform
                .set_voice_mute(key.guild_id, key.user_id, false)
                .await
            {
                debug!(%key, error = %e, "Voice unmute deferred until the member reappears in voice");
                self.store.add_pending_unmute(key);
            }
        }

        self.store.delete(key);
        self.persist().await;
        self.note_case(key.guild_id, &record, "Timed mute expired").await;

        let reached = self
            .platform
            .send_direct_message(key.user_id, "Your mute has expired.")
            .await;
        info!(%key, reached, "Punishment expired");
        drop(_guard);
        self.prune_lock(key);
        reached
    }

    /// Handle an external edit of the restriction role (manual moderator
    /// action outside this system's own calls).
    pub async fn reconcile_on_external_change(
        &self,
        guild_id: u64,
        user_id: u64,
        role_present_before: bool,
        role_present_after: bool,
    ) {
        let key = PunishKey::new(guild_id, user_id);
        if role_present_before && !role_present_after {
            let _guard = self.key_guard(key).await;
            let Some(record) = self.store.get(key) else {
                return;
            };
            // Early manual unpunish; the role is already gone, so the
            // cleanup skips the role call.
            self.scheduler.cancel(key);
            if record.unmute_pending {
                if let Err(e) = self.platform.set_voice_mute(guild_id, user_id, false).await {
                    debug!(%key, error = %e, "Voice unmute deferred until the member reappears in voice");
                    self.store.add_pending_unmute(key);
                }
            }
            self.store.delete(key);
            self.persist().await;
            self.note_case(guild_id, &record, "Restriction role removed manually")
                .await;
            info!(%key, "External role removal treated as manual unpunish");
            drop(_guard);
            self.prune_lock(key);
        } else if !role_present_before && role_present_after {
            if self.store.get(key).is_none() {
                // Not adopted into tracking: without a record no
                // expiration is owed for it.
                info!(%key, "Restriction role added externally without a record, not tracking");
            }
        }
    }

    /// A punished member left and rejoined: the restriction persists, so
    /// re-apply the role and re-arm the single scheduler entry.
    pub async fn on_member_rejoin(&self, guild_id: u64, user_id: u64) {
        let key = PunishKey::new(guild_id, user_id);
        let _guard = self.key_guard(key).await;

        let Some(record) = self.store.get(key) else {
            return;
        };
        let Some(role_id) = self.platform.restriction_role(guild_id) else {
            warn!(%key, "Punished member rejoined but no restriction role is configured");
            return;
        };
        if let Err(e) = self.platform.add_role(guild_id, user_id, role_id).await {
            warn!(%key, error = %e, "Could not re-apply restriction role on rejoin");
            return;
        }
        if let Some(until) = record.until {
            self.scheduler.rearm(self.deadline(until), key);
        }
        info!(%key, "Restriction role re-applied after rejoin");
    }

    /// Ban or platform-confirmed departure: drop the record without
    /// touching roles, close the case quietly, no direct message.
    pub async fn on_member_removed_permanently(&self, guild_id: u64, user_id: u64) {
        let key = PunishKey::new(guild_id, user_id);
        let _guard = self.key_guard(key).await;

        let Some(record) = self.store.get(key) else {
            return;
        };
        self.scheduler.cancel(key);
        self.store.delete(key);
        self.persist().await;
        self.note_case(guild_id, &record, "Closed: member permanently removed from guild")
            .await;
        info!(%key, "Punishment dropped, member permanently gone");
        drop(_guard);
        self.prune_lock(key);
    }

    /// A member surfaced in a voice channel: settle any owed voice unmute
    /// left over from a cleanup that could not reach them.
    pub async fn on_voice_state_update(&self, guild_id: u64, user_id: u64) {
        let key = PunishKey::new(guild_id, user_id);
        if !self.store.take_pending_unmute(key) {
            return;
        }
        match self.platform.set_voice_mute(guild_id, user_id, false).await {
            Ok(()) => {
                info!(%key, "Settled owed voice unmute");
                self.persist().await;
            }
            Err(e) => {
                debug!(%key, error = %e, "Owed voice unmute still out of reach");
                self.store.add_pending_unmute(key);
            }
        }
    }

    /// Repair drift between persisted state and live membership/role
    /// state after a restart, and re-arm timers for everything still
    /// active. Must complete before the scheduler's promotion loop starts.
    pub async fn reconcile_on_startup(&self) {
        let mut dirty = false;

        for (key, record) in self.store.all() {
            if !self.platform.has_guild_access(key.guild_id) {
                info!(%key, "Purging record for inaccessible guild");
                self.store.delete(key);
                dirty = true;
                continue;
            }

            if record.until.is_some_and(|until| until <= (self.clock)()) {
                // Covers expiries that passed during downtime
                self.expire(key).await;
                continue;
            }

            if self
                .platform
                .resolve_member(key.guild_id, key.user_id)
                .await
                .is_none()
            {
                info!(%key, "Member no longer resolvable, dropping record");
                self.store.delete(key);
                dirty = true;
                continue;
            }

            if let Some(role_id) = self.platform.restriction_role(key.guild_id) {
                match self.platform.has_role(key.guild_id, key.user_id, role_id).await {
                    Ok(false) => {
                        if let Err(e) =
                            self.platform.add_role(key.guild_id, key.user_id, role_id).await
                        {
                            warn!(%key, error = %e, "Could not restore restriction role");
                        }
                    }
                    Ok(true) => {}
                    Err(e) => warn!(%key, error = %e, "Could not check restriction role"),
                }
            }

            if let Some(until) = record.until {
                self.scheduler.rearm(self.deadline(until), key);
            }
        }

        for key in self.store.pending_unmutes() {
            if !self.platform.has_guild_access(key.guild_id) {
                self.store.take_pending_unmute(key);
                dirty = true;
                continue;
            }
            let in_voice = self
                .platform
                .resolve_member(key.guild_id, key.user_id)
                .await
                .is_some_and(|member| member.in_voice);
            if in_voice && self.store.take_pending_unmute(key) {
                match self
                    .platform
                    .set_voice_mute(key.guild_id, key.user_id, false)
                    .await
                {
                    Ok(()) => dirty = true,
                    Err(e) => {
                        debug!(%key, error = %e, "Owed voice unmute still out of reach");
                        self.store.add_pending_unmute(key);
                    }
                }
            }
        }

        if dirty {
            self.persist().await;
        }
        info!(
            active = self.store.len(),
            "Startup reconciliation complete"
        );
    }

    /// Start the scheduler's promotion loop. Call after
    /// [`Self::install_callback`] and [`Self::reconcile_on_startup`].
    pub fn start_expirations(&self) {
        self.scheduler.start();
    }

    /// Current record for a member, if any
    #[must_use]
    pub fn get_record(&self, guild_id: u64, user_id: u64) -> Option<PunishmentRecord> {
        self.store.get(PunishKey::new(guild_id, user_id))
    }

    /// Active punishments in a guild, for listing
    #[must_use]
    pub fn list_guild(&self, guild_id: u64) -> Vec<(u64, PunishmentRecord)> {
        let mut entries: Vec<(u64, PunishmentRecord)> = self
            .store
            .all()
            .into_iter()
            .filter(|(key, _)| key.guild_id == guild_id)
            .map(|(key, record)| (key.user_id, record))
            .collect();
        entries.sort_by_key(|(_, record)| record.until);
        entries
    }

    fn update_schedule(&self, key: PunishKey, until: Option<DateTime<Utc>>) {
        match until {
            Some(until) => self.scheduler.rearm(self.deadline(until), key),
            None => {
                self.scheduler.cancel(key);
            }
        }
    }

    fn deadline(&self, until: DateTime<Utc>) -> Instant {
        deadline_from_until(until, (self.clock)())
    }

    async fn note_case(&self, guild_id: u64, record: &PunishmentRecord, note: &str) {
        let Some(modlog) = &self.modlog else {
            return;
        };
        let Some(case_ref) = record.case_ref else {
            return;
        };
        if let Err(e) = modlog.update_case(guild_id, case_ref, note).await {
            warn!(case_ref, error = %e, "Could not update moderation-log case");
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.store.persist().await {
            error!(error = %e, "Failed to persist punishment store");
        }
    }

    async fn key_guard(&self, key: PunishKey) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the per-key lock once nobody else holds a clone. Call only
    /// after releasing the guard; both the clone in [`Self::key_guard`]
    /// and this removal run under the map's shard lock, so a concurrent
    /// caller either keeps the entry alive or recreates it.
    fn prune_lock(&self, key: PunishKey) {
        self.locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn describe_expiry(until: Option<DateTime<Utc>>) -> String {
    match until {
        Some(until) => format!(
            "expiring in {}",
            render_duration((until - Utc::now()).num_seconds().max(0), false)
        ),
        None => "indefinite".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::punishment::platform::{MemberInfo, MockModLog, MockPlatform};
    use chrono::Duration as ChronoDuration;
    use std::path::PathBuf;
    use tokio::time::Duration;

    const GUILD: u64 = 67890;
    const USER: u64 = 12345;
    const MODERATOR: u64 = 99999;
    const ROLE: u64 = 555;

    fn temp_store() -> PunishmentStore {
        let path: PathBuf =
            std::env::temp_dir().join(format!("mutekeeper-mgr-{}.yaml", uuid::Uuid::new_v4()));
        PunishmentStore::new(path)
    }

    /// Wall clock anchored to the tokio clock, so paused-time tests see
    /// expiries fall due as the runtime advances
    fn anchored_clock() -> Clock {
        let instant_anchor = Instant::now();
        let utc_anchor = Utc::now();
        Arc::new(move || {
            utc_anchor
                + ChronoDuration::from_std(instant_anchor.elapsed()).unwrap_or_default()
        })
    }

    fn build(
        platform: MockPlatform,
        modlog: Option<MockModLog>,
    ) -> (Arc<PunishmentManager>, Arc<ExpirationScheduler>) {
        let scheduler = Arc::new(ExpirationScheduler::new());
        let mut manager = PunishmentManager::new(
            temp_store(),
            Arc::clone(&scheduler),
            Arc::new(platform),
            modlog.map(|m| Arc::new(m) as Arc<dyn ModLog>),
        );
        manager.clock = anchored_clock();
        (Arc::new(manager), scheduler)
    }

    /// Platform that lets a straightforward punish go through
    fn happy_platform() -> MockPlatform {
        let mut platform = MockPlatform::new();
        platform.expect_can_moderate().returning(|_, _, _| true);
        platform
            .expect_restriction_role()
            .returning(|_| Some(ROLE));
        platform.expect_role_manageable().returning(|_, _| true);
        platform
            .expect_set_voice_mute()
            .returning(|_, user, _| Err(PlatformError::NoVoiceSession(user)));
        platform
            .expect_send_direct_message()
            .returning(|_, _| true);
        platform
            .expect_has_role()
            .returning(|_, _, _| Ok(true));
        platform
    }

    #[tokio::test]
    async fn test_punish_applies_role_and_schedules() {
        let mut platform = happy_platform();
        platform
            .expect_add_role()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (manager, scheduler) = build(platform, None);

        let outcome = manager
            .punish(GUILD, USER, MODERATOR, Some(3600), Some("spam".to_string()))
            .await
            .unwrap();

        let until = outcome.until().expect("timed punishment has an expiry");
        let delta = (until - Utc::now()).num_seconds();
        assert!((3590..=3600).contains(&delta), "until ~ now+3600, got {delta}");

        let record = manager.get_record(GUILD, USER).expect("record created");
        assert_eq!(record.issued_by, MODERATOR);
        assert_eq!(record.reason.as_deref(), Some("spam"));
        assert!(!record.unmute_pending);

        let key = PunishKey::new(GUILD, USER);
        assert!(scheduler.is_scheduled(key));
        assert_eq!(scheduler.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_punish_self_is_denied() {
        let (manager, scheduler) = build(MockPlatform::new(), None);
        let result = manager
            .punish(GUILD, MODERATOR, MODERATOR, Some(60), None)
            .await;
        assert!(matches!(result, Err(PunishError::HierarchyDenied(_))));
        assert!(manager.get_record(GUILD, MODERATOR).is_none());
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_punish_peer_is_denied() {
        let mut platform = MockPlatform::new();
        platform.expect_can_moderate().returning(|_, _, _| false);
        let (manager, _) = build(platform, None);
        let result = manager.punish(GUILD, USER, MODERATOR, Some(60), None).await;
        assert!(matches!(result, Err(PunishError::HierarchyDenied(_))));
    }

    #[tokio::test]
    async fn test_punish_requires_manageable_role() {
        let mut platform = MockPlatform::new();
        platform.expect_can_moderate().returning(|_, _, _| true);
        platform
            .expect_restriction_role()
            .returning(|_| Some(ROLE));
        platform.expect_role_manageable().returning(|_, _| false);
        let (manager, _) = build(platform, None);
        let result = manager.punish(GUILD, USER, MODERATOR, Some(60), None).await;
        assert!(matches!(result, Err(PunishError::RoleUnmanageable(ROLE))));

        let mut platform = MockPlatform::new();
        platform.expect_can_moderate().returning(|_, _, _| true);
        platform.expect_restriction_role().returning(|_| None);
        let (manager, _) = build(platform, None);
        let result = manager.punish(GUILD, USER, MODERATOR, Some(60), None).await;
        assert!(matches!(result, Err(PunishError::RoleNotConfigured(GUILD))));
    }

    #[tokio::test]
    async fn test_repunish_preserves_start_updates_rest() {
        let mut platform = happy_platform();
        // The renewal sees the role already present and does not re-apply it
        platform
            .expect_add_role()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (manager, scheduler) = build(platform, None);

        manager
            .punish(GUILD, USER, MODERATOR, Some(60), Some("spam".to_string()))
            .await
            .unwrap();
        let original = manager.get_record(GUILD, USER).unwrap();

        let outcome = manager
            .punish(
                GUILD,
                USER,
                MODERATOR + 1,
                Some(7200),
                Some("still spamming".to_string()),
            )
            .await
            .unwrap();

        let PunishOutcome::Renewed { start, until } = outcome else {
            panic!("second punish should renew");
        };
        assert_eq!(start, original.start);
        let delta = (until.unwrap() - Utc::now()).num_seconds();
        assert!((7190..=7200).contains(&delta));

        let record = manager.get_record(GUILD, USER).unwrap();
        assert_eq!(record.start, original.start);
        assert_eq!(record.issued_by, MODERATOR + 1);
        assert_eq!(record.reason.as_deref(), Some("still spamming"));

        // Re-arm, not a second entry
        assert_eq!(scheduler.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_renewal_to_indefinite_cancels_entry() {
        let mut platform = happy_platform();
        platform.expect_add_role().returning(|_, _, _| Ok(()));
        let (manager, scheduler) = build(platform, None);
        manager
            .punish(GUILD, USER, MODERATOR, Some(600), None)
            .await
            .unwrap();
        assert!(scheduler.is_scheduled(PunishKey::new(GUILD, USER)));

        manager
            .punish(GUILD, USER, MODERATOR, None, None)
            .await
            .unwrap();
        assert!(!scheduler.is_scheduled(PunishKey::new(GUILD, USER)));
        assert!(manager.get_record(GUILD, USER).unwrap().until.is_none());
    }

    #[tokio::test]
    async fn test_unpunish_without_record_is_nothing_to_do() {
        // No expectations registered: any platform call would panic
        let (manager, _) = build(MockPlatform::new(), None);
        let removed = manager.unpunish(GUILD, USER, None, MODERATOR).await.unwrap();
        assert!(!removed);
    }

    #[tokio::test]
    async fn test_unpunish_cleans_up() {
        let mut platform = happy_platform();
        platform.expect_add_role().returning(|_, _, _| Ok(()));
        platform
            .expect_remove_role()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (manager, scheduler) = build(platform, None);

        manager
            .punish(GUILD, USER, MODERATOR, Some(600), None)
            .await
            .unwrap();
        let removed = manager
            .unpunish(GUILD, USER, Some("appealed"), MODERATOR)
            .await
            .unwrap();

        assert!(removed);
        assert!(manager.get_record(GUILD, USER).is_none());
        assert!(!scheduler.is_scheduled(PunishKey::new(GUILD, USER)));
    }

    #[tokio::test]
    async fn test_unpunish_role_failure_keeps_record() {
        let mut platform = happy_platform();
        platform.expect_add_role().returning(|_, _, _| Ok(()));
        platform
            .expect_remove_role()
            .returning(|_, _, _| Err(PlatformError::Api("503".to_string())));
        let (manager, scheduler) = build(platform, None);

        manager
            .punish(GUILD, USER, MODERATOR, Some(600), None)
            .await
            .unwrap();
        let result = manager.unpunish(GUILD, USER, None, MODERATOR).await;

        assert!(matches!(result, Err(PunishError::PlatformUnavailable(_))));
        assert!(manager.get_record(GUILD, USER).is_some());
        assert!(scheduler.is_scheduled(PunishKey::new(GUILD, USER)));
    }

    #[tokio::test]
    async fn test_expire_without_record_is_stale() {
        let (manager, _) = build(MockPlatform::new(), None);
        assert!(manager.expire(PunishKey::new(GUILD, USER)).await);
    }

    #[tokio::test]
    async fn test_expire_undue_record_rearms_from_store() {
        let (manager, scheduler) = build(MockPlatform::new(), None);
        let key = PunishKey::new(GUILD, USER);
        manager
            .store
            .put(key, PunishmentRecord::new(MODERATOR, Some(600), None));

        assert!(manager.expire(key).await);
        assert!(manager.get_record(GUILD, USER).is_some());
        assert!(scheduler.is_scheduled(key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_thirty_minute_punishment_lifecycle() {
        let mut platform = happy_platform();
        platform.expect_add_role().returning(|_, _, _| Ok(()));
        platform
            .expect_remove_role()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut modlog = MockModLog::new();
        modlog
            .expect_open_case()
            .times(1)
            .returning(|_, _, _, _, _| Ok(77));
        modlog
            .expect_update_case()
            .withf(|_, case_ref, note| *case_ref == 77 && note.contains("expired"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (manager, scheduler) = build(platform, Some(modlog));

        manager
            .punish(
                GUILD,
                USER,
                MODERATOR,
                Some(1800),
                Some("spam".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(manager.get_record(GUILD, USER).unwrap().case_ref, Some(77));

        // A 30 minute deadline starts in the far queue
        let key = PunishKey::new(GUILD, USER);
        assert_eq!(scheduler.is_armed(key), Some(false));

        manager.install_callback();
        scheduler.start();

        tokio::time::timeout(Duration::from_secs(3600), async {
            while manager.get_record(GUILD, USER).is_some() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
        .await
        .expect("punishment expires");
        assert!(!scheduler.is_scheduled(key));
    }

    #[tokio::test]
    async fn test_short_punishment_opens_no_case() {
        let mut platform = happy_platform();
        platform.expect_add_role().returning(|_, _, _| Ok(()));
        let (manager, _) = build(platform, Some(MockModLog::new()));
        manager
            .punish(GUILD, USER, MODERATOR, Some(300), None)
            .await
            .unwrap();
        assert!(manager.get_record(GUILD, USER).unwrap().case_ref.is_none());
    }

    #[tokio::test]
    async fn test_startup_reconciliation_expires_past_due() {
        let mut platform = MockPlatform::new();
        platform.expect_has_guild_access().returning(|_| true);
        platform
            .expect_restriction_role()
            .returning(|_| Some(ROLE));
        platform
            .expect_remove_role()
            .times(1)
            .returning(|_, _, _| Ok(()));
        platform
            .expect_send_direct_message()
            .returning(|_, _| true);
        let (manager, scheduler) = build(platform, None);

        let key = PunishKey::new(GUILD, USER);
        let mut record = PunishmentRecord::new(MODERATOR, Some(3600), None);
        record.until = Some(Utc::now() - ChronoDuration::seconds(10));
        manager.store.put(key, record);

        manager.reconcile_on_startup().await;

        assert!(manager.get_record(GUILD, USER).is_none());
        assert!(!scheduler.is_scheduled(key));
    }

    #[tokio::test]
    async fn test_startup_reconciliation_restores_role_and_rearms() {
        let mut platform = MockPlatform::new();
        platform.expect_has_guild_access().returning(|_| true);
        platform
            .expect_restriction_role()
            .returning(|_| Some(ROLE));
        platform.expect_resolve_member().returning(|_, user| {
            Some(MemberInfo {
                user_id: user,
                display_name: "test".to_string(),
                in_voice: false,
            })
        });
        platform
            .expect_has_role()
            .returning(|_, _, _| Ok(false));
        platform
            .expect_add_role()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (manager, scheduler) = build(platform, None);

        let key = PunishKey::new(GUILD, USER);
        manager
            .store
            .put(key, PunishmentRecord::new(MODERATOR, Some(3600), None));

        manager.reconcile_on_startup().await;

        assert!(manager.get_record(GUILD, USER).is_some());
        assert!(scheduler.is_scheduled(key));
    }

    #[tokio::test]
    async fn test_startup_reconciliation_drops_unresolvable_member() {
        let mut platform = MockPlatform::new();
        platform.expect_has_guild_access().returning(|_| true);
        platform.expect_resolve_member().returning(|_, _| None);
        let (manager, scheduler) = build(platform, None);

        let key = PunishKey::new(GUILD, USER);
        manager
            .store
            .put(key, PunishmentRecord::new(MODERATOR, Some(3600), None));

        manager.reconcile_on_startup().await;

        assert!(manager.get_record(GUILD, USER).is_none());
        assert!(!scheduler.is_scheduled(key));
    }

    #[tokio::test]
    async fn test_startup_reconciliation_purges_inaccessible_guild() {
        let mut platform = MockPlatform::new();
        platform.expect_has_guild_access().returning(|_| false);
        let (manager, _) = build(platform, None);

        manager
            .store
            .put(PunishKey::new(GUILD, USER), PunishmentRecord::new(MODERATOR, None, None));

        manager.reconcile_on_startup().await;
        assert!(manager.get_record(GUILD, USER).is_none());
    }

    #[tokio::test]
    async fn test_rejoin_reapplies_role_single_entry() {
        let mut platform = happy_platform();
        platform
            .expect_add_role()
            .times(2)
            .returning(|_, _, _| Ok(()));
        let (manager, scheduler) = build(platform, None);

        manager
            .punish(GUILD, USER, MODERATOR, Some(600), None)
            .await
            .unwrap();
        manager.on_member_rejoin(GUILD, USER).await;

        assert!(manager.get_record(GUILD, USER).is_some());
        assert_eq!(scheduler.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_external_role_removal_is_manual_unpunish() {
        // remove_role must not be called again: the role is already gone
        let mut platform = happy_platform();
        platform.expect_add_role().returning(|_, _, _| Ok(()));
        let (manager, scheduler) = build(platform, None);

        manager
            .punish(GUILD, USER, MODERATOR, Some(600), None)
            .await
            .unwrap();
        manager
            .reconcile_on_external_change(GUILD, USER, true, false)
            .await;

        assert!(manager.get_record(GUILD, USER).is_none());
        assert!(!scheduler.is_scheduled(PunishKey::new(GUILD, USER)));
    }

    #[tokio::test]
    async fn test_external_role_add_is_not_adopted() {
        let (manager, scheduler) = build(MockPlatform::new(), None);
        manager
            .reconcile_on_external_change(GUILD, USER, false, true)
            .await;
        assert!(manager.get_record(GUILD, USER).is_none());
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_permanent_removal_is_quiet() {
        // No role calls and no direct message; only the case is closed
        let mut modlog = MockModLog::new();
        modlog
            .expect_update_case()
            .withf(|_, case_ref, note| *case_ref == 5 && note.contains("permanently"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (manager, scheduler) = build(MockPlatform::new(), Some(modlog));

        let key = PunishKey::new(GUILD, USER);
        let mut record = PunishmentRecord::new(MODERATOR, Some(3600), None);
        record.case_ref = Some(5);
        manager.store.put(key, record);

        manager.on_member_removed_permanently(GUILD, USER).await;

        assert!(manager.get_record(GUILD, USER).is_none());
        assert!(!scheduler.is_scheduled(key));
    }

    #[tokio::test]
    async fn test_list_guild_is_scoped_and_sorted() {
        let (manager, _) = build(MockPlatform::new(), None);
        manager.store.put(
            PunishKey::new(GUILD, 1),
            PunishmentRecord::new(MODERATOR, Some(7200), None),
        );
        manager.store.put(
            PunishKey::new(GUILD, 2),
            PunishmentRecord::new(MODERATOR, Some(60), None),
        );
        manager.store.put(
            PunishKey::new(GUILD + 1, 3),
            PunishmentRecord::new(MODERATOR, Some(60), None),
        );

        let listed = manager.list_guild(GUILD);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, 2, "soonest expiry first");
        assert_eq!(listed[1].0, 1);
    }

    #[tokio::test]
    async fn test_owed_unmute_settles_on_voice_join() {
        let mut platform = MockPlatform::new();
        platform.expect_can_moderate().returning(|_, _, _| true);
        platform
            .expect_restriction_role()
            .returning(|_| Some(ROLE));
        platform.expect_role_manageable().returning(|_, _| true);
        platform
            .expect_send_direct_message()
            .returning(|_, _| true);
        platform.expect_add_role().returning(|_, _, _| Ok(()));
        platform.expect_remove_role().returning(|_, _, _| Ok(()));
        // The mute lands while the member is in voice; by unpunish time
        // they have left, so the unmute misses until they come back.
        platform
            .expect_set_voice_mute()
            .withf(|_, _, muted| *muted)
            .times(1)
            .returning(|_, _, _| Ok(()));
        platform
            .expect_set_voice_mute()
            .withf(|_, _, muted| !*muted)
            .times(1)
            .returning(|_, user, _| Err(PlatformError::NoVoiceSession(user)));
        platform
            .expect_set_voice_mute()
            .withf(|_, _, muted| !*muted)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (manager, _) = build(platform, None);

        manager
            .punish(GUILD, USER, MODERATOR, Some(600), None)
            .await
            .unwrap();
        assert!(manager.get_record(GUILD, USER).unwrap().unmute_pending);

        manager.unpunish(GUILD, USER, None, MODERATOR).await.unwrap();
        let key = PunishKey::new(GUILD, USER);
        assert_eq!(manager.store.pending_unmutes(), vec![key], "unmute owed");

        manager.on_voice_state_update(GUILD, USER).await;
        assert!(manager.store.pending_unmutes().is_empty());

        // Settled at most once; a further voice event makes no platform call
        manager.on_voice_state_update(GUILD, USER).await;
    }

    #[tokio::test]
    async fn test_owed_unmute_survives_a_failed_retry() {
        let mut platform = MockPlatform::new();
        platform
            .expect_set_voice_mute()
            .times(1)
            .returning(|_, user, _| Err(PlatformError::NoVoiceSession(user)));
        let (manager, _) = build(platform, None);

        let key = PunishKey::new(GUILD, USER);
        manager.store.add_pending_unmute(key);
        manager.on_voice_state_update(GUILD, USER).await;

        assert_eq!(manager.store.pending_unmutes(), vec![key], "still owed");
    }

    #[tokio::test]
    async fn test_key_locks_pruned_after_removal() {
        let mut platform = happy_platform();
        platform.expect_add_role().returning(|_, _, _| Ok(()));
        platform.expect_remove_role().returning(|_, _, _| Ok(()));
        let (manager, _) = build(platform, None);

        manager
            .punish(GUILD, USER, MODERATOR, Some(600), None)
            .await
            .unwrap();
        assert_eq!(manager.locks.len(), 1);

        manager.unpunish(GUILD, USER, None, MODERATOR).await.unwrap();
        assert!(manager.locks.is_empty(), "per-key lock released with the record");
    }
}

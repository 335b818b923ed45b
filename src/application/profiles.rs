//! Profile store: normalized profiles, merge updates and share links.
//!
//! This store is the only place that writes `patient_profiles`. It keeps
//! one invariant for every profile it hands out: `profile_data.medications`
//! is a list. Records that arrive from storage in any other shape are fixed
//! and, when they are loaded as the working record, written back so the next
//! reader sees the fixed shape too.
//!
//! The working record (`current`) and the list entries are held as
//! `Arc<Profile>` and replaced wholesale on every change. A subscriber can
//! compare pointers to tell whether a re-render is due.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::state::{lock, Status, StoreEvent};
use super::{decode, decode_all, first_row, tables};
use crate::domain::access_link::{AccessLink, LinkStatus, NewAccessLink, DEFAULT_EXPIRY_HOURS};
use crate::domain::profile::{
    merge_profile_data, normalize_profile, MergeDepth, NewProfile, Normalized, Profile,
    ProfileUpdate, Repair, PROFILE_DATA,
};
use crate::ports::{Clock, Filter, Order, Query, RemoteTable, Row, SystemClock};
use crate::{MedProfileError, Result};

#[derive(Debug, Default)]
struct ProfileState {
    profiles: Vec<Arc<Profile>>,
    current: Option<Arc<Profile>>,
}

/// Store for patient profiles and their share links.
pub struct ProfileStore<T, C = SystemClock>
where
    T: RemoteTable,
    C: Clock,
{
    tables: Arc<T>,
    clock: Arc<C>,
    merge_depth: MergeDepth,
    link_expiry_hours: i64,
    state: Mutex<ProfileState>,
    status: Status,
}

impl<T: RemoteTable> ProfileStore<T, SystemClock> {
    /// Create a store reading time from the wall clock.
    pub fn new(tables: Arc<T>) -> Self {
        Self::with_clock(tables, Arc::new(SystemClock))
    }
}

impl<T, C> ProfileStore<T, C>
where
    T: RemoteTable,
    C: Clock,
{
    /// Create a store with an explicit clock.
    pub fn with_clock(tables: Arc<T>, clock: Arc<C>) -> Self {
        Self {
            tables,
            clock,
            merge_depth: MergeDepth::default(),
            link_expiry_hours: DEFAULT_EXPIRY_HOURS,
            state: Mutex::new(ProfileState::default()),
            status: Status::default(),
        }
    }

    /// How deep `profile_data` patches merge into the loaded document.
    #[must_use]
    pub fn with_merge_depth(mut self, depth: MergeDepth) -> Self {
        self.merge_depth = depth;
        self
    }

    /// Lifetime of share links when the caller does not pass one.
    #[must_use]
    pub fn with_link_expiry_hours(mut self, hours: i64) -> Self {
        self.link_expiry_hours = hours;
        self
    }

    #[must_use]
    pub fn profiles(&self) -> Vec<Arc<Profile>> {
        lock(&self.state).profiles.clone()
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<Profile>> {
        lock(&self.state).current.clone()
    }

    #[must_use]
    pub fn loading(&self) -> bool {
        self.status.loading()
    }

    /// Message from the last failed operation, cleared when the next one starts.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.status.error()
    }

    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        self.status.subscribe()
    }

    /// Load every profile of a patient, newest first, and make it the list.
    ///
    /// # Errors
    /// Returns the remote failure or a decode error.
    pub async fn fetch_patient_profiles(&self, patient_id: &str) -> Result<Vec<Arc<Profile>>> {
        self.status
            .track(
                "Failed to fetch patient profiles",
                self.load_patient_profiles(patient_id),
            )
            .await
    }

    /// Load one profile, repair it if needed and make it the current record.
    ///
    /// # Errors
    /// Returns `NotFound` if no row has this id, or the remote failure
    /// (including a failed repair write).
    pub async fn fetch_profile_by_id(&self, profile_id: &str) -> Result<Arc<Profile>> {
        self.status
            .track("Failed to fetch profile", self.load_current(profile_id))
            .await
    }

    /// Insert a profile and make it the current record.
    ///
    /// # Errors
    /// Returns the remote failure or a decode error.
    pub async fn create_profile(&self, new: NewProfile) -> Result<Arc<Profile>> {
        self.status
            .track("Failed to create profile", self.insert_profile(new))
            .await
    }

    /// Apply a partial update.
    ///
    /// When the profile is the current record, `profile_data` is merged over
    /// the loaded document (see [`merge_profile_data`]). Returns `None` if no
    /// row matched.
    ///
    /// # Errors
    /// Returns `Validation` for updates that would break the medication list,
    /// or the remote failure. In-memory state is untouched on error.
    pub async fn update_profile(
        &self,
        profile_id: &str,
        update: ProfileUpdate,
    ) -> Result<Option<Arc<Profile>>> {
        self.status
            .track("Failed to update profile", self.apply_update(profile_id, update))
            .await
    }

    /// Delete a profile and drop it from memory.
    ///
    /// # Errors
    /// Returns the remote failure.
    pub async fn delete_profile(&self, profile_id: &str) -> Result<()> {
        self.status
            .track("Failed to delete profile", self.remove_profile(profile_id))
            .await
    }

    /// Issue a share link and point the profile's `viewable_link_id` at it.
    ///
    /// The link row is not rolled back if the profile update fails.
    ///
    /// # Errors
    /// Returns `Validation` for a non-positive lifetime, `NotFound` if the
    /// profile vanished, or the remote failure of either write.
    pub async fn create_profile_link(
        &self,
        profile_id: &str,
        expiry_hours: Option<i64>,
    ) -> Result<AccessLink> {
        self.status
            .track(
                "Failed to create profile link",
                self.issue_link(profile_id, expiry_hours),
            )
            .await
    }

    /// Revoke a share link.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown link, or the remote failure.
    pub async fn revoke_profile_link(&self, link_id: &str) -> Result<AccessLink> {
        self.status
            .track("Failed to revoke profile link", self.deactivate_link(link_id))
            .await
    }

    /// Resolve a share token to its profile without touching the current record.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown token, `LinkUnavailable` for an
    /// expired or revoked link, or the remote failure.
    pub async fn open_shared_profile(&self, unique_hash: &str) -> Result<Arc<Profile>> {
        self.status
            .track("Failed to open shared profile", self.resolve_link(unique_hash))
            .await
    }

    /// Replace the current record, or clear it with `None`.
    pub fn set_current_profile(&self, profile: Option<Profile>) {
        match profile {
            Some(profile) => {
                self.install_current(profile);
            }
            None => self.clear_current_profile(),
        }
    }

    pub fn clear_current_profile(&self) {
        lock(&self.state).current = None;
        self.status.emit(StoreEvent::CurrentChanged);
    }

    async fn load_patient_profiles(&self, patient_id: &str) -> Result<Vec<Arc<Profile>>> {
        let query = Query::new()
            .filter(Filter::eq("patient_id", patient_id))
            .order(Order::desc("created_at"));
        let rows = self.tables.select(tables::PROFILES, &query).await?;

        let mut profiles = rows
            .into_iter()
            .map(|row| normalize_profile(row).map(|n| n.profile))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.attach_links(&mut profiles).await?;

        let profiles: Vec<Arc<Profile>> = profiles.into_iter().map(Arc::new).collect();
        lock(&self.state).profiles = profiles.clone();
        self.status.emit(StoreEvent::CollectionChanged);

        tracing::debug!(count = profiles.len(), "Loaded patient profiles");
        Ok(profiles)
    }

    async fn load_current(&self, profile_id: &str) -> Result<Arc<Profile>> {
        let profile = self.load_profile(profile_id).await?;
        Ok(self.install_current(profile))
    }

    /// Fetch by id through the normalizer, writing any repair back.
    async fn load_profile(&self, profile_id: &str) -> Result<Profile> {
        let query = Query::new().filter(Filter::eq("id", profile_id));
        let rows = self.tables.select(tables::PROFILES, &query).await?;
        let row = first_row(rows, || format!("profile {profile_id}"))?;

        let Normalized {
            mut profile,
            repair,
        } = normalize_profile(row)?;
        if let Some(repair) = repair {
            self.write_back(&profile, repair).await?;
        }

        self.attach_links(std::slice::from_mut(&mut profile)).await?;
        Ok(profile)
    }

    async fn insert_profile(&self, new: NewProfile) -> Result<Arc<Profile>> {
        let rows = self.tables.insert(tables::PROFILES, vec![new.to_row()]).await?;
        let Normalized { profile, repair } =
            normalize_profile(first_row(rows, || "inserted profile".to_string())?)?;
        if let Some(repair) = repair {
            self.try_write_back(&profile, repair).await;
        }

        let profile = Arc::new(profile);
        {
            let mut state = lock(&self.state);
            state.profiles.insert(0, Arc::clone(&profile));
            state.current = Some(Arc::clone(&profile));
        }
        self.status.emit(StoreEvent::CollectionChanged);
        self.status.emit(StoreEvent::CurrentChanged);

        tracing::info!(profile_id = %profile.id, "Created profile");
        Ok(profile)
    }

    async fn apply_update(
        &self,
        profile_id: &str,
        update: ProfileUpdate,
    ) -> Result<Option<Arc<Profile>>> {
        update.validate().map_err(MedProfileError::Validation)?;

        let base = self.current().filter(|current| current.id == profile_id);
        let ProfileUpdate {
            profile_data,
            fields: mut patch,
        } = update;

        if let Some(partial) = profile_data {
            let document = match &base {
                Some(current) => {
                    tracing::debug!(
                        profile_id,
                        depth = ?self.merge_depth,
                        "Merging profile_data with the loaded profile"
                    );
                    merge_profile_data(&current.profile_data, &partial, self.merge_depth).to_value()
                }
                None => Value::Object(partial),
            };
            patch.insert(PROFILE_DATA.to_string(), document);
        }

        let rows = self
            .tables
            .update(tables::PROFILES, &[Filter::eq("id", profile_id)], patch)
            .await?;
        let Some(row) = rows.into_iter().next() else {
            tracing::warn!(profile_id, "Profile update matched no rows");
            return Ok(None);
        };

        let Normalized {
            mut profile,
            repair,
        } = normalize_profile(row)?;
        if let Some(previous) = self.find(profile_id) {
            profile.access_links = previous.access_links.clone();
        }

        let is_current = self.current().is_some_and(|current| current.id == profile_id);
        if let (true, Some(repair)) = (is_current, repair) {
            self.try_write_back(&profile, repair).await;
        }

        let profile = Arc::new(profile);
        let (in_list, was_current) = {
            let mut state = lock(&self.state);
            let in_list = match state.profiles.iter_mut().find(|p| p.id == profile_id) {
                Some(slot) => {
                    *slot = Arc::clone(&profile);
                    true
                }
                None => false,
            };
            let was_current = match &mut state.current {
                Some(current) if current.id == profile_id => {
                    *current = Arc::clone(&profile);
                    true
                }
                _ => false,
            };
            (in_list, was_current)
        };
        if in_list {
            self.status.emit(StoreEvent::CollectionChanged);
        } else {
            tracing::debug!(profile_id, "Updated profile is not in the loaded list");
        }
        if was_current {
            self.status.emit(StoreEvent::CurrentChanged);
        }

        Ok(Some(profile))
    }

    async fn remove_profile(&self, profile_id: &str) -> Result<()> {
        self.tables
            .delete(tables::PROFILES, &[Filter::eq("id", profile_id)])
            .await?;

        let cleared = {
            let mut state = lock(&self.state);
            state.profiles.retain(|p| p.id != profile_id);
            let matches = state.current.as_ref().is_some_and(|c| c.id == profile_id);
            if matches {
                state.current = None;
            }
            matches
        };
        self.status.emit(StoreEvent::CollectionChanged);
        if cleared {
            self.status.emit(StoreEvent::CurrentChanged);
        }

        tracing::info!(profile_id, "Deleted profile");
        Ok(())
    }

    async fn issue_link(&self, profile_id: &str, expiry_hours: Option<i64>) -> Result<AccessLink> {
        let hours = expiry_hours.unwrap_or(self.link_expiry_hours);
        let request = NewAccessLink::issue(profile_id, self.clock.now(), hours)
            .map_err(MedProfileError::Validation)?;

        let rows = self
            .tables
            .insert(tables::ACCESS_LINKS, vec![request.to_row()])
            .await?;
        let link: AccessLink = decode(first_row(rows, || "inserted share link".to_string())?)?;
        tracing::info!(
            profile_id,
            link_id = %link.id,
            expires = %link.expiry_time,
            "Issued share link"
        );

        let linked = self
            .apply_update(
                profile_id,
                ProfileUpdate::new().with_field("viewable_link_id", link.id.clone()),
            )
            .await?;
        if linked.is_none() {
            return Err(MedProfileError::NotFound(format!(
                "profile {profile_id} (share link {} was created but not attached)",
                link.id
            )));
        }

        if self.current().is_some_and(|current| current.id == profile_id) {
            let refreshed = self.load_profile(profile_id).await?;
            self.install_current(refreshed);
        }

        Ok(link)
    }

    async fn deactivate_link(&self, link_id: &str) -> Result<AccessLink> {
        let mut patch = Row::new();
        patch.insert("is_active".to_string(), Value::Bool(false));

        let rows = self
            .tables
            .update(tables::ACCESS_LINKS, &[Filter::eq("id", link_id)], patch)
            .await?;
        let link: AccessLink = decode(first_row(rows, || format!("share link {link_id}"))?)?;
        self.replace_link(&link);

        tracing::info!(link_id, profile_id = %link.profile_id, "Revoked share link");
        Ok(link)
    }

    async fn resolve_link(&self, unique_hash: &str) -> Result<Arc<Profile>> {
        let query = Query::new().filter(Filter::eq("unique_hash", unique_hash));
        let rows = self.tables.select(tables::ACCESS_LINKS, &query).await?;
        let link: AccessLink = decode(first_row(rows, || "share link".to_string())?)?;

        match link.status_at(self.clock.now()) {
            LinkStatus::Active => {}
            status => {
                tracing::info!(link_id = %link.id, %status, "Refused share link");
                return Err(MedProfileError::LinkUnavailable(status));
            }
        }

        let profile = self.load_profile(&link.profile_id).await?;
        Ok(Arc::new(profile))
    }

    /// Attach each profile's share links, newest first.
    async fn attach_links(&self, profiles: &mut [Profile]) -> Result<()> {
        if profiles.is_empty() {
            return Ok(());
        }

        let ids = profiles.iter().map(|p| p.id.clone());
        let query = Query::new()
            .filter(Filter::is_in("profile_id", ids))
            .order(Order::desc("created_at"));
        let rows = self.tables.select(tables::ACCESS_LINKS, &query).await?;
        let links: Vec<AccessLink> = decode_all(rows)?;

        for profile in profiles.iter_mut() {
            profile.access_links = links
                .iter()
                .filter(|link| link.profile_id == profile.id)
                .cloned()
                .collect();
        }
        Ok(())
    }

    /// Persist a repaired `profile_data` directly, bypassing the merge engine.
    async fn write_back(&self, profile: &Profile, repair: Repair) -> Result<()> {
        tracing::info!(profile_id = %profile.id, %repair, "Writing repaired profile_data back");

        let mut patch = Row::new();
        patch.insert(PROFILE_DATA.to_string(), profile.profile_data.to_value());
        self.tables
            .update(
                tables::PROFILES,
                &[Filter::eq("id", profile.id.as_str())],
                patch,
            )
            .await?;
        Ok(())
    }

    /// Write-back after a successful mutation; a failure here must not
    /// undo the mutation, so it is only logged.
    async fn try_write_back(&self, profile: &Profile, repair: Repair) {
        if let Err(e) = self.write_back(profile, repair).await {
            tracing::warn!(profile_id = %profile.id, "Failed to write repaired profile back: {e}");
        }
    }

    fn find(&self, profile_id: &str) -> Option<Arc<Profile>> {
        let state = lock(&self.state);
        state
            .current
            .iter()
            .chain(state.profiles.iter())
            .find(|p| p.id == profile_id)
            .cloned()
    }

    fn install_current(&self, profile: Profile) -> Arc<Profile> {
        let profile = Arc::new(profile);
        let in_list = {
            let mut state = lock(&self.state);
            let in_list = match state.profiles.iter_mut().find(|p| p.id == profile.id) {
                Some(slot) => {
                    *slot = Arc::clone(&profile);
                    true
                }
                None => false,
            };
            state.current = Some(Arc::clone(&profile));
            in_list
        };

        if in_list {
            self.status.emit(StoreEvent::CollectionChanged);
        }
        self.status.emit(StoreEvent::CurrentChanged);
        profile
    }

    /// Swap an updated link into every loaded profile that carries it.
    ///
    /// A profile held both in the list and as `current` gets one replacement
    /// shared by both slots.
    fn replace_link(&self, link: &AccessLink) {
        let (list_changed, current_changed) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let mut replacements: HashMap<String, Arc<Profile>> = HashMap::new();
            let mut swap = |slot: &mut Arc<Profile>| {
                if !slot.access_links.iter().any(|l| l.id == link.id) {
                    return false;
                }
                let replacement = replacements.entry(slot.id.clone()).or_insert_with(|| {
                    let mut updated = Profile::clone(slot);
                    for existing in updated.access_links.iter_mut().filter(|l| l.id == link.id) {
                        *existing = link.clone();
                    }
                    Arc::new(updated)
                });
                *slot = Arc::clone(replacement);
                true
            };

            let mut list_changed = false;
            for slot in &mut state.profiles {
                list_changed |= swap(slot);
            }
            let current_changed = state.current.as_mut().is_some_and(|slot| swap(slot));
            (list_changed, current_changed)
        };

        if list_changed {
            self.status.emit(StoreEvent::CollectionChanged);
        }
        if current_changed {
            self.status.emit(StoreEvent::CurrentChanged);
        }
    }
}

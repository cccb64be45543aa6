//! Cached entities and the API payloads that upsert onto them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{Entity, EntityKind, Merge, Snapshot, Tables, Upsert, WriteTransaction};
use crate::dates;
use crate::fetch::FetchResponse;

/// Host that serves avatar images.
const AVATAR_IMAGE_HOST: &str = "https://images.overtime.tv/avatars/";

/// Width requested for avatar images.
const AVATAR_IMAGE_WIDTH: u32 = 240;

fn merge_value<T: Clone>(slot: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *slot = value.clone();
    }
}

fn merge_option<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        slot.clone_from(value);
    }
}

// ============================================================================
// User
// ============================================================================

/// A cached user record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub uuid: String,
    pub dynamodb_id: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub bio: Option<String>,
    pub instagram_id: Option<String>,
    pub image_path: Option<String>,
    pub avatar_id: Option<String>,
    pub location: Option<String>,
    pub camera_tos_agreed_at: Option<DateTime<Utc>>,
    pub scores_tos_agreed_at: Option<DateTime<Utc>>,
    pub consecutive_days_started_at: Option<DateTime<Utc>>,
    pub phone_verified: bool,
    pub is_camera_authorized: bool,
    pub is_camera_requested: bool,
    pub is_camera_rejected: bool,
    pub is_banned: bool,
    pub is_username_change_required: bool,
    pub is_name_change_required: bool,
    pub is_image_change_required: bool,
    pub is_bio_change_required: bool,
    pub is_comment_acknowledge_required: bool,
    pub is_trusted_scores_host: bool,
    pub is_bets_requested: bool,
    pub is_bets_granted: bool,
    pub roles: Vec<String>,
    pub device_ids: Vec<String>,
    pub prioritized_headline_tags: Vec<String>,
    pub notification_types: Vec<String>,
    pub favorite_team_ids: Vec<String>,
    pub total_coins: i64,
    pub total_wagered_coins: i64,
    pub total_potential_coins: i64,
    pub total_experience_points: i64,
    pub current_experience_level_id: Option<String>,
    pub factual_question_pools_joined_count: i64,
}

impl User {
    /// An anonymous user created from a device id.
    pub fn is_device_user(&self) -> bool {
        !self.phone_verified
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "mod")
    }

    pub fn is_tester(&self) -> bool {
        self.roles.iter().any(|r| r == "tester")
    }

    /// Whether moderation requires the user to acknowledge or change something.
    pub fn requires_moderation_acknowledgement(&self) -> bool {
        self.is_banned
            || self.is_username_change_required
            || self.is_name_change_required
            || self.is_image_change_required
            || self.is_bio_change_required
            || self.is_comment_acknowledge_required
    }

    /// The user's selected avatar.
    pub fn avatar<'a>(&self, snapshot: &'a Snapshot) -> Option<&'a Avatar> {
        self.avatar_id.as_deref().and_then(|id| snapshot.get(id))
    }

    /// Avatars this user has unlocked.
    pub fn user_avatars<'a>(&self, snapshot: &'a Snapshot) -> Vec<&'a UserAvatar> {
        snapshot.filter(|ua: &UserAvatar| ua.user_id.as_deref() == Some(self.id.as_str()))
    }
}

impl Entity for User {
    const KIND: EntityKind = EntityKind::User;

    fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn table(tables: &Tables) -> &HashMap<String, Self> {
        &tables.users
    }

    fn table_mut(tables: &mut Tables) -> &mut HashMap<String, Self> {
        &mut tables.users
    }
}

/// Public profile fields of a user, as returned in listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseUserResponse {
    pub id: String,
    pub dynamodb_id: Option<String>,
    pub uuid: Option<String>,
    pub name: Option<String>,
    pub bio: Option<String>,
    pub username: Option<String>,
    pub instagram_id: Option<String>,
    pub image_path: Option<String>,
    pub location: Option<String>,
    pub avatar_id: Option<String>,
    pub total_coins: Option<i64>,
    pub total_potential_coins: Option<i64>,
    pub total_wagered_coins: Option<i64>,
    pub total_experience_points: Option<i64>,
    pub current_experience_level_id: Option<String>,
    pub factual_question_pools_joined_count: Option<i64>,
    pub is_trusted_scores_host: Option<bool>,
    pub is_bets_requested: Option<bool>,
    pub is_bets_granted: Option<bool>,
}

/// The full user record, as returned to the user themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserResponse {
    #[serde(flatten)]
    pub profile: SparseUserResponse,
    pub phone_verified: Option<bool>,
    pub device_ids: Option<Vec<String>>,
    #[serde(default, deserialize_with = "dates::deserialize_option")]
    pub camera_tos_agreed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "dates::deserialize_option")]
    pub scores_tos_agreed_at: Option<DateTime<Utc>>,
    pub roles: Option<Vec<String>>,
    pub is_camera_requested: Option<bool>,
    pub is_camera_authorized: Option<bool>,
    pub is_camera_rejected: Option<bool>,
    pub prioritized_headline_tags: Option<Vec<String>>,
    pub is_banned: Option<bool>,
    pub is_username_change_required: Option<bool>,
    pub is_name_change_required: Option<bool>,
    pub is_image_change_required: Option<bool>,
    pub is_bio_change_required: Option<bool>,
    pub is_comment_acknowledge_required: Option<bool>,
}

impl Merge<SparseUserResponse> for User {
    fn merge(&mut self, from: &SparseUserResponse) {
        match &from.uuid {
            Some(uuid) => self.uuid.clone_from(uuid),
            None if self.uuid.is_empty() => self.uuid.clone_from(&from.id),
            None => {}
        }
        merge_value(&mut self.dynamodb_id, &from.dynamodb_id);
        merge_option(&mut self.username, &from.username);
        merge_option(&mut self.name, &from.name);
        merge_option(&mut self.bio, &from.bio);
        merge_option(&mut self.instagram_id, &from.instagram_id);
        merge_option(&mut self.location, &from.location);
        merge_option(&mut self.image_path, &from.image_path);
        merge_option(&mut self.avatar_id, &from.avatar_id);
        merge_option(
            &mut self.current_experience_level_id,
            &from.current_experience_level_id,
        );
        merge_value(&mut self.total_coins, &from.total_coins);
        merge_value(&mut self.total_potential_coins, &from.total_potential_coins);
        merge_value(&mut self.total_wagered_coins, &from.total_wagered_coins);
        merge_value(&mut self.total_experience_points, &from.total_experience_points);
        merge_value(
            &mut self.factual_question_pools_joined_count,
            &from.factual_question_pools_joined_count,
        );
        merge_value(&mut self.is_trusted_scores_host, &from.is_trusted_scores_host);
        merge_value(&mut self.is_bets_requested, &from.is_bets_requested);
        merge_value(&mut self.is_bets_granted, &from.is_bets_granted);
    }
}

impl Merge<UserResponse> for User {
    fn merge(&mut self, from: &UserResponse) {
        self.merge(&from.profile);

        merge_value(&mut self.phone_verified, &from.phone_verified);
        merge_value(&mut self.device_ids, &from.device_ids);
        merge_option(&mut self.camera_tos_agreed_at, &from.camera_tos_agreed_at);
        merge_option(&mut self.scores_tos_agreed_at, &from.scores_tos_agreed_at);
        merge_value(&mut self.roles, &from.roles);
        merge_value(&mut self.is_camera_requested, &from.is_camera_requested);
        merge_value(&mut self.is_camera_authorized, &from.is_camera_authorized);
        merge_value(&mut self.is_camera_rejected, &from.is_camera_rejected);
        merge_value(
            &mut self.prioritized_headline_tags,
            &from.prioritized_headline_tags,
        );
        merge_value(&mut self.is_banned, &from.is_banned);
        merge_value(
            &mut self.is_username_change_required,
            &from.is_username_change_required,
        );
        merge_value(&mut self.is_name_change_required, &from.is_name_change_required);
        merge_value(&mut self.is_image_change_required, &from.is_image_change_required);
        merge_value(&mut self.is_bio_change_required, &from.is_bio_change_required);
        merge_value(
            &mut self.is_comment_acknowledge_required,
            &from.is_comment_acknowledge_required,
        );
    }
}

impl Upsert for SparseUserResponse {
    type Target = User;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Upsert for UserResponse {
    type Target = User;

    fn entity_id(&self) -> &str {
        &self.profile.id
    }
}

// ============================================================================
// Avatar
// ============================================================================

/// A cached avatar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Avatar {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub is_listed: bool,
    pub is_initial: bool,
    pub name: Option<String>,
    pub image_path: Option<String>,
    pub cost: i64,
    pub image_placeholder_color: i64,
    pub required_experience_level_id: Option<String>,
    pub is_unlocked: bool,
}

impl Default for Avatar {
    fn default() -> Self {
        Self {
            id: String::new(),
            created_at: None,
            is_listed: true,
            is_initial: false,
            name: None,
            image_path: None,
            cost: 0,
            image_placeholder_color: 0,
            required_experience_level_id: None,
            is_unlocked: false,
        }
    }
}

impl Avatar {
    /// URL of the rendered avatar image.
    pub fn image_url(&self) -> Option<String> {
        self.image_path.as_ref().map(|path| {
            format!(
                "{}{}?width={}&format=png",
                AVATAR_IMAGE_HOST, path, AVATAR_IMAGE_WIDTH
            )
        })
    }
}

impl Entity for Avatar {
    const KIND: EntityKind = EntityKind::Avatar;

    fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn table(tables: &Tables) -> &HashMap<String, Self> {
        &tables.avatars
    }

    fn table_mut(tables: &mut Tables) -> &mut HashMap<String, Self> {
        &mut tables.avatars
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvatarResponse {
    pub id: String,
    #[serde(default, deserialize_with = "dates::deserialize_option")]
    pub created_at: Option<DateTime<Utc>>,
    pub cost: Option<i64>,
    pub is_listed: Option<bool>,
    pub is_initial: Option<bool>,
    pub name: Option<String>,
    pub image_path: Option<String>,
    pub image_placeholder_color: Option<i64>,
    pub required_experience_level_id: Option<String>,
    pub user_avatars: Option<Vec<UserAvatarResponse>>,
}

impl Merge<AvatarResponse> for Avatar {
    fn merge(&mut self, from: &AvatarResponse) {
        merge_option(&mut self.created_at, &from.created_at);
        merge_value(&mut self.is_listed, &from.is_listed);
        merge_value(&mut self.is_initial, &from.is_initial);
        merge_option(&mut self.name, &from.name);
        merge_option(&mut self.image_path, &from.image_path);
        merge_value(&mut self.cost, &from.cost);
        merge_value(&mut self.image_placeholder_color, &from.image_placeholder_color);
        merge_option(
            &mut self.required_experience_level_id,
            &from.required_experience_level_id,
        );
        if let Some(user_avatars) = &from.user_avatars {
            self.is_unlocked = !user_avatars.is_empty();
        }
    }
}

impl Upsert for AvatarResponse {
    type Target = Avatar;

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn upsert_related(&self, txn: &mut WriteTransaction) {
        for user_avatar in self.user_avatars.iter().flatten() {
            txn.upsert(user_avatar);
        }
    }
}

// ============================================================================
// UserAvatar
// ============================================================================

/// Link between a user and an avatar they own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAvatar {
    pub id: String,
    pub user_id: Option<String>,
    pub avatar_id: Option<String>,
}

impl UserAvatar {
    pub fn avatar<'a>(&self, snapshot: &'a Snapshot) -> Option<&'a Avatar> {
        self.avatar_id.as_deref().and_then(|id| snapshot.get(id))
    }

    pub fn user<'a>(&self, snapshot: &'a Snapshot) -> Option<&'a User> {
        self.user_id.as_deref().and_then(|id| snapshot.get(id))
    }
}

impl Entity for UserAvatar {
    const KIND: EntityKind = EntityKind::UserAvatar;

    fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn table(tables: &Tables) -> &HashMap<String, Self> {
        &tables.user_avatars
    }

    fn table_mut(tables: &mut Tables) -> &mut HashMap<String, Self> {
        &mut tables.user_avatars
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAvatarResponse {
    pub id: String,
    pub user_id: String,
    pub avatar_id: String,
}

impl Merge<UserAvatarResponse> for UserAvatar {
    fn merge(&mut self, from: &UserAvatarResponse) {
        self.user_id = Some(from.user_id.clone());
        self.avatar_id = Some(from.avatar_id.clone());
    }
}

impl Upsert for UserAvatarResponse {
    type Target = UserAvatar;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

// ============================================================================
// Fetch responses
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct UsersFetchResponse {
    pub users: Vec<UserResponse>,
}

impl FetchResponse for UsersFetchResponse {
    type Object = UserResponse;

    fn objects(&self) -> Vec<&UserResponse> {
        self.users.iter().collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserFetchResponse {
    pub user: UserResponse,
}

impl FetchResponse for UserFetchResponse {
    type Object = UserResponse;

    fn objects(&self) -> Vec<&UserResponse> {
        vec![&self.user]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SparseUsersFetchResponse {
    pub users: Vec<SparseUserResponse>,
}

impl FetchResponse for SparseUsersFetchResponse {
    type Object = SparseUserResponse;

    fn objects(&self) -> Vec<&SparseUserResponse> {
        self.users.iter().collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AvatarsFetchResponse {
    pub avatars: Vec<AvatarResponse>,
}

impl FetchResponse for AvatarsFetchResponse {
    type Object = AvatarResponse;

    fn objects(&self) -> Vec<&AvatarResponse> {
        self.avatars.iter().collect()
    }
}

/// Notification types a user is subscribed to. Not cached as entities.
#[derive(Debug, Clone, Deserialize)]
pub struct UserNotificationTypesFetchResponse {
    pub notification_types: Vec<String>,
}

impl FetchResponse for UserNotificationTypesFetchResponse {
    type Object = String;

    fn objects(&self) -> Vec<&String> {
        self.notification_types.iter().collect()
    }
}

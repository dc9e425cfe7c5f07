//! Lookups against the relational store: users, roles, clients, scopes and
//! identity providers. Every call runs under the external-call deadline.

use crate::entity::{client, identity_provider, ip_access_token, scope, user, user_role};
use crate::error::SsoError;
use crate::utils::within;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, TransactionTrait,
};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Profile fields of a new account.
#[derive(Clone, Debug, Default)]
pub struct NewUser {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub gender: Option<String>,
    pub profile_picture: Option<String>,
    pub password_hash: Option<String>,
}

/// Local account a new provider link points at.
#[derive(Clone, Debug)]
pub enum LinkedAccount {
    Existing(user::Model),
    New(NewUser),
}

/// Provider subject and the provider tokens stored with its link.
#[derive(Clone, Debug)]
pub struct IdentityLink {
    pub provider_id: String,
    pub sub_id: String,
    pub token: String,
    pub refresh_token: Option<String>,
}

fn user_row(new: NewUser, now: OffsetDateTime) -> user::ActiveModel {
    user::ActiveModel {
        id: Set(uuid::Uuid::new_v4().to_string()),
        first_name: Set(new.first_name),
        middle_name: Set(new.middle_name),
        last_name: Set(new.last_name),
        email: Set(new.email),
        phone: Set(new.phone),
        gender: Set(new.gender),
        profile_picture: Set(new.profile_picture),
        password_hash: Set(new.password_hash),
        status: Set(user::STATUS_ACTIVE.to_string()),
        created_at: Set(now),
        updated_at: Set(now),
    }
}

#[derive(Clone)]
pub struct Directory {
    db: Arc<DatabaseConnection>,
    timeout: Duration,
}

impl Directory {
    pub fn new(db: Arc<DatabaseConnection>, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    pub fn db(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    pub async fn client(&self, id: &str) -> Result<Option<client::Model>, SsoError> {
        within(
            self.timeout,
            "database",
            client::Entity::find_by_id(id).one(self.db()),
        )
        .await
    }

    /// Active scopes among `names`, in request order.
    pub async fn scopes(&self, names: &[String]) -> Result<Vec<scope::Model>, SsoError> {
        let found = within(
            self.timeout,
            "database",
            scope::Entity::find()
                .filter(scope::Column::Name.is_in(names.iter().cloned()))
                .filter(scope::Column::Status.eq(user::STATUS_ACTIVE))
                .all(self.db()),
        )
        .await?;
        Ok(names
            .iter()
            .filter_map(|name| found.iter().find(|s| &s.name == name).cloned())
            .collect())
    }

    pub async fn user(&self, id: &str) -> Result<Option<user::Model>, SsoError> {
        within(
            self.timeout,
            "database",
            user::Entity::find_by_id(id).one(self.db()),
        )
        .await
    }

    pub async fn user_by_phone(&self, phone: &str) -> Result<Option<user::Model>, SsoError> {
        within(
            self.timeout,
            "database",
            user::Entity::find()
                .filter(user::Column::Phone.eq(phone))
                .one(self.db()),
        )
        .await
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<user::Model>, SsoError> {
        within(
            self.timeout,
            "database",
            user::Entity::find()
                .filter(user::Column::Email.eq(email))
                .one(self.db()),
        )
        .await
    }

    /// Role names assigned to the user, sorted.
    pub async fn roles(&self, user_id: &str) -> Result<Vec<String>, SsoError> {
        let rows = within(
            self.timeout,
            "database",
            user_role::Entity::find()
                .filter(user_role::Column::UserId.eq(user_id))
                .all(self.db()),
        )
        .await?;
        let mut roles: Vec<String> = rows.into_iter().map(|r| r.role).collect();
        roles.sort();
        Ok(roles)
    }

    pub async fn create_user(&self, new: NewUser) -> Result<user::Model, SsoError> {
        if let Some(phone) = &new.phone
            && self.user_by_phone(phone).await?.is_some()
        {
            return Err(SsoError::DataExists("phone is already registered".into()));
        }
        if let Some(email) = &new.email
            && self.user_by_email(email).await?.is_some()
        {
            return Err(SsoError::DataExists("email is already registered".into()));
        }

        let row = user_row(new, OffsetDateTime::now_utc());
        let created = within(self.timeout, "database", row.insert(self.db())).await?;
        tracing::info!(user_id = %created.id, "user created");
        Ok(created)
    }

    pub async fn set_password_hash(
        &self,
        user: user::Model,
        password_hash: String,
    ) -> Result<(), SsoError> {
        let mut active = user.into_active_model();
        active.password_hash = Set(Some(password_hash));
        active.updated_at = Set(OffsetDateTime::now_utc());
        within(self.timeout, "database", active.update(self.db()))
            .await
            .map(|_| ())
    }

    pub async fn identity_provider(
        &self,
        id: &str,
    ) -> Result<Option<identity_provider::Model>, SsoError> {
        within(
            self.timeout,
            "database",
            identity_provider::Entity::find_by_id(id).one(self.db()),
        )
        .await
    }

    pub async fn identity_link(
        &self,
        provider_id: &str,
        sub_id: &str,
    ) -> Result<Option<ip_access_token::Model>, SsoError> {
        within(
            self.timeout,
            "database",
            ip_access_token::Entity::find()
                .filter(ip_access_token::Column::IdentityProviderId.eq(provider_id))
                .filter(ip_access_token::Column::SubId.eq(sub_id))
                .one(self.db()),
        )
        .await
    }

    /// Store fresh provider tokens on an existing link.
    pub async fn refresh_identity_tokens(
        &self,
        link: ip_access_token::Model,
        token: String,
        refresh_token: Option<String>,
    ) -> Result<(), SsoError> {
        let mut active = link.into_active_model();
        active.token = Set(token);
        active.refresh_token = Set(refresh_token);
        active.updated_at = Set(OffsetDateTime::now_utc());
        within(self.timeout, "database", active.update(self.db()))
            .await
            .map(|_| ())
    }

    /// Create the account when it is new, then its provider link, in one
    /// transaction. A failed link insert leaves no account behind.
    pub async fn link_identity(
        &self,
        account: LinkedAccount,
        link: IdentityLink,
    ) -> Result<user::Model, SsoError> {
        let linked = self.db.transaction::<_, user::Model, SsoError>(|txn| {
            Box::pin(async move {
                let now = OffsetDateTime::now_utc();
                let user = match account {
                    LinkedAccount::Existing(user) => user,
                    LinkedAccount::New(new) => {
                        let created = user_row(new, now).insert(txn).await?;
                        tracing::info!(user_id = %created.id, "user created");
                        created
                    }
                };
                ip_access_token::ActiveModel {
                    id: Set(uuid::Uuid::new_v4().to_string()),
                    user_id: Set(user.id.clone()),
                    sub_id: Set(link.sub_id),
                    identity_provider_id: Set(link.provider_id),
                    token: Set(link.token),
                    refresh_token: Set(link.refresh_token),
                    status: Set(user::STATUS_ACTIVE.to_string()),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(txn)
                .await?;
                Ok(user)
            })
        });
        within(self.timeout, "database", linked).await
    }
}

//! Creates the authorization server schema.
//!
//! - client / scope: registered OAuth2 clients and the scopes they may request
//! - users / user_role: accounts and their role assignments
//! - auth_code / refresh_token: issued grants
//! - auth_history: append-only authorization audit trail
//! - identity_provider / ip_access_token: federation providers and account links

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Client::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Client::Id).string().not_null().primary_key())
                    .col(ColumnDef::new(Client::Name).string().not_null())
                    .col(ColumnDef::new(Client::Description).text().null())
                    .col(ColumnDef::new(Client::LogoUrl).string().null())
                    .col(ColumnDef::new(Client::SecretHash).string().not_null())
                    .col(ColumnDef::new(Client::RedirectUris).text().not_null())
                    .col(
                        ColumnDef::new(Client::Scopes)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Client::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(Client::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Client::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Scope::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Scope::Name).string().not_null().primary_key())
                    .col(ColumnDef::new(Scope::Description).text().not_null())
                    .col(
                        ColumnDef::new(Scope::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(User::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(User::Id).string().not_null().primary_key())
                    .col(ColumnDef::new(User::FirstName).string().not_null())
                    .col(ColumnDef::new(User::MiddleName).string().null())
                    .col(ColumnDef::new(User::LastName).string().not_null())
                    .col(ColumnDef::new(User::Email).string().null().unique_key())
                    .col(ColumnDef::new(User::Phone).string().null().unique_key())
                    .col(ColumnDef::new(User::Gender).string().null())
                    .col(ColumnDef::new(User::ProfilePicture).string().null())
                    .col(ColumnDef::new(User::PasswordHash).string().null())
                    .col(
                        ColumnDef::new(User::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(User::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(User::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(UserRole::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(UserRole::UserId).string().not_null())
                    .col(ColumnDef::new(UserRole::Role).string().not_null())
                    .primary_key(Index::create().col(UserRole::UserId).col(UserRole::Role))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_role_user_id")
                            .from(UserRole::Table, UserRole::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(AuthCode::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuthCode::Code)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AuthCode::ClientId).string().not_null())
                    .col(ColumnDef::new(AuthCode::UserId).string().not_null())
                    .col(ColumnDef::new(AuthCode::RedirectUri).text().not_null())
                    .col(ColumnDef::new(AuthCode::Scope).text().not_null())
                    .col(ColumnDef::new(AuthCode::State).string().not_null())
                    .col(ColumnDef::new(AuthCode::Roles).text().not_null())
                    .col(ColumnDef::new(AuthCode::Nonce).string().null())
                    .col(ColumnDef::new(AuthCode::CodeChallenge).string().null())
                    .col(ColumnDef::new(AuthCode::CodeChallengeMethod).string().null())
                    .col(
                        ColumnDef::new(AuthCode::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AuthCode::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RefreshToken::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RefreshToken::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RefreshToken::Token)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(RefreshToken::Code).string().null())
                    .col(ColumnDef::new(RefreshToken::UserId).string().not_null())
                    .col(ColumnDef::new(RefreshToken::ClientId).string().not_null())
                    .col(ColumnDef::new(RefreshToken::Scope).text().not_null())
                    .col(ColumnDef::new(RefreshToken::Roles).text().not_null())
                    .col(ColumnDef::new(RefreshToken::RedirectUri).text().null())
                    .col(
                        ColumnDef::new(RefreshToken::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RefreshToken::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RefreshToken::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(AuthHistory::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuthHistory::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AuthHistory::UserId).string().not_null())
                    .col(ColumnDef::new(AuthHistory::ClientId).string().not_null())
                    .col(ColumnDef::new(AuthHistory::Scope).text().null())
                    .col(ColumnDef::new(AuthHistory::Status).string().not_null())
                    .col(
                        ColumnDef::new(AuthHistory::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(IdentityProvider::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IdentityProvider::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(IdentityProvider::Name).string().not_null())
                    .col(ColumnDef::new(IdentityProvider::ClientId).string().not_null())
                    .col(
                        ColumnDef::new(IdentityProvider::ClientSecret)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IdentityProvider::RedirectUri).text().not_null())
                    .col(
                        ColumnDef::new(IdentityProvider::AuthorizationEndpoint)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IdentityProvider::TokenEndpoint)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IdentityProvider::UserInfoEndpoint)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IdentityProvider::LogoUri).text().null())
                    .col(
                        ColumnDef::new(IdentityProvider::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(IdentityProvider::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IdentityProvider::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(IpAccessToken::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IpAccessToken::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(IpAccessToken::UserId).string().not_null())
                    .col(ColumnDef::new(IpAccessToken::SubId).string().not_null())
                    .col(
                        ColumnDef::new(IpAccessToken::IdentityProviderId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IpAccessToken::Token).text().not_null())
                    .col(ColumnDef::new(IpAccessToken::RefreshToken).text().null())
                    .col(
                        ColumnDef::new(IpAccessToken::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(IpAccessToken::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IpAccessToken::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_ip_access_token_user_id")
                            .from(IpAccessToken::Table, IpAccessToken::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One link per provider subject
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_ip_access_token_provider_sub")
                    .table(IpAccessToken::Table)
                    .col(IpAccessToken::IdentityProviderId)
                    .col(IpAccessToken::SubId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_refresh_token_user_client")
                    .table(RefreshToken::Table)
                    .col(RefreshToken::UserId)
                    .col(RefreshToken::ClientId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_auth_code_expires_at")
                    .table(AuthCode::Table)
                    .col(AuthCode::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_auth_history_user_id")
                    .table(AuthHistory::Table)
                    .col(AuthHistory::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for index in [
            "idx_auth_history_user_id",
            "idx_auth_code_expires_at",
            "idx_refresh_token_user_client",
            "idx_ip_access_token_provider_sub",
        ] {
            manager
                .drop_index(Index::drop().name(index).to_owned())
                .await?;
        }

        manager
            .drop_table(Table::drop().table(IpAccessToken::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(IdentityProvider::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AuthHistory::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RefreshToken::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AuthCode::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(UserRole::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(User::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Scope::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Client::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Client {
    Table,
    Id,
    Name,
    Description,
    LogoUrl,
    SecretHash,
    RedirectUris,
    Scopes,
    Status,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Scope {
    Table,
    Name,
    Description,
    Status,
}

#[derive(DeriveIden)]
enum User {
    #[sea_orm(iden = "users")]
    Table,
    Id,
    FirstName,
    MiddleName,
    LastName,
    Email,
    Phone,
    Gender,
    ProfilePicture,
    PasswordHash,
    Status,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum UserRole {
    Table,
    UserId,
    Role,
}

#[derive(DeriveIden)]
enum AuthCode {
    Table,
    Code,
    ClientId,
    UserId,
    RedirectUri,
    Scope,
    State,
    Roles,
    Nonce,
    CodeChallenge,
    CodeChallengeMethod,
    ExpiresAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum RefreshToken {
    Table,
    Id,
    Token,
    Code,
    UserId,
    ClientId,
    Scope,
    Roles,
    RedirectUri,
    ExpiresAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AuthHistory {
    Table,
    Id,
    UserId,
    ClientId,
    Scope,
    Status,
    CreatedAt,
}

#[derive(DeriveIden)]
enum IdentityProvider {
    Table,
    Id,
    Name,
    ClientId,
    ClientSecret,
    RedirectUri,
    AuthorizationEndpoint,
    TokenEndpoint,
    UserInfoEndpoint,
    LogoUri,
    Status,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum IpAccessToken {
    Table,
    Id,
    UserId,
    SubId,
    IdentityProviderId,
    Token,
    RefreshToken,
    Status,
    CreatedAt,
    UpdatedAt,
}

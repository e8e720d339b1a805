use crate::access::Role;
use crate::auth;
use crate::db::operations::users::{self, NewUser};
use crate::db::DatabaseProxy;

/// Creates the first administrator from `ADMIN_EMAIL` / `ADMIN_PASSWORD` when the
/// `users` table is empty. Does nothing once any account exists.
pub async fn seed_admin(proxy: &DatabaseProxy) {
    let (Ok(email), Ok(password)) = (std::env::var("ADMIN_EMAIL"), std::env::var("ADMIN_PASSWORD"))
    else {
        tracing::debug!("ADMIN_EMAIL/ADMIN_PASSWORD not set, skipping admin seed");
        return;
    };

    match users::count_users(proxy).await {
        Ok(0) => {}
        Ok(_) => {
            tracing::debug!("users already exist, skipping admin seed");
            return;
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to count users for admin seed");
            return;
        }
    }

    let Some(email) = auth::normalize_email(&email) else {
        tracing::warn!("ADMIN_EMAIL is not a valid email address, skipping admin seed");
        return;
    };
    if let Err(reason) = auth::check_password_strength(&password) {
        tracing::warn!(reason, "ADMIN_PASSWORD rejected, skipping admin seed");
        return;
    }

    let password_hash = match auth::hash_password(&password) {
        Ok(hash) => hash,
        Err(err) => {
            tracing::warn!(error = %err, "failed to hash admin password");
            return;
        }
    };
    let username = std::env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string());

    match users::insert_user(
        proxy,
        NewUser {
            email,
            username,
            password_hash,
            role: Role::Admin,
            department_id: None,
            group_id: None,
        },
    )
    .await
    {
        Ok(user) => tracing::info!(user_id = %user.id, "seeded initial admin account"),
        Err(err) => tracing::warn!(error = %err, "failed to seed admin account"),
    }
}

//! Authentication and account key management.
//!
//! Provides:
//! - Signup material generation (keypairs, wrapped keys, SRP verifier)
//! - The three-round SRP login flow with mandatory server verification
//! - Two-factor completion
//! - Rehydration of stored private keys
//!
//! ## Quick Start
//!
//! ```ignore
//! let api = ApiClient::new("https://api.gladysgateway.com", Role::User)?;
//!
//! let result = match auth::login(&api, email, password).await {
//!     Ok(result) => result,
//!     Err(Error::Auth(AuthError::TwoFactorRequired { two_factor_token })) => {
//!         let code = prompt("TOTP code: ");
//!         auth::login_two_factor(&api, &two_factor_token, &code, password).await?
//!     }
//!     Err(e) => return Err(e),
//! };
//!
//! // result.keys holds the decrypted private keys;
//! // result.serialized_keys and result.refresh_token go to caller storage.
//! ```

mod login;
mod srp;
mod types;

pub use login::{
    DecryptedKeys, LoginResult, SignupMaterial, generate_signup_material, keys_from_serialized,
    login, login_two_factor, normalize_email, normalize_password,
};
pub use srp::{SrpAuthClient, derive_srp_private_key, derive_verifier};
pub use types::{AuthError, Result};

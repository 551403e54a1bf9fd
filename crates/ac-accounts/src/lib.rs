//! Minecraft accounts on top of the `ac-auth` login chain
//!
//! Three kinds of [`Account`] share one load/login contract: refresh-token
//! accounts drive the full chain, session-token accounts only fetch their
//! profile, and external accounts are resolved through an
//! [`InventoryClient`].

pub mod account;
mod errors;
pub mod inventory;
pub mod picker;
mod store;

pub use account::{
    Account, AccountContext, AccountKind, ExternalAccount, ExternalStrategy, ExternalToken,
    GameSession, ProfileCache, RefreshTokenAccount, SessionTokenAccount,
};
pub use errors::{AccountError, AccountStoreError, InventoryError};
pub use inventory::{InventoryClient, InventorySummary, InventoryUser};
pub use picker::{PickOutcome, StopFlag, pick_external_account};
pub use store::AccountStore;

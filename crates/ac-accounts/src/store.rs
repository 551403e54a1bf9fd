use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::account::Account;
use crate::errors::AccountStoreError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: Vec<Account>,
}

/// The saved account list, kept in `accounts.toml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountStore {
    path: PathBuf,
    accounts: Vec<Account>,
}

impl AccountStore {
    pub fn default_path() -> Result<PathBuf, AccountStoreError> {
        let proj_dirs = ProjectDirs::from("dev", "authchain", "authchain-mc").ok_or_else(|| {
            error!("Failed to determine project directories - this usually indicates an unsupported OS or missing home directory");
            AccountStoreError::ProjectDirectoriesUnavailable
        })?;
        Ok(proj_dirs.data_dir().join("accounts.toml"))
    }

    /// Load the list at `path`; a missing file is an empty list
    #[instrument(level = "debug")]
    pub async fn load(path: &Path) -> Result<Self, AccountStoreError> {
        if tokio::fs::metadata(path).await.is_err() {
            info!("Accounts file doesn't exist yet: {}", path.display());
            return Ok(Self {
                path: path.to_path_buf(),
                accounts: Vec::new(),
            });
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read accounts.toml file")
            .map_err(|e| {
                error!("Failed to read accounts file {}: {}", path.display(), e);
                AccountStoreError::AccountsFileReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;

        let file: AccountsFile = toml::from_str(&content)
            .context("Failed to parse accounts.toml file")
            .map_err(|e| {
                error!("Failed to parse accounts file {}: {}", path.display(), e);
                AccountStoreError::AccountsParsingFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;

        debug!(
            "Loaded {} accounts from {}",
            file.accounts.len(),
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            accounts: file.accounts,
        })
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn save(&self) -> Result<(), AccountStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create accounts directory")
                .map_err(|e| {
                    error!("Failed to create directory {}: {}", parent.display(), e);
                    AccountStoreError::DirectoryCreationFailed {
                        path: parent.to_path_buf(),
                        source: e,
                    }
                })?;
        }

        let file = AccountsFile {
            accounts: self.accounts.clone(),
        };
        let toml = toml::to_string_pretty(&file)
            .context("Failed to serialize accounts to TOML")
            .map_err(|e| {
                error!("Failed to serialize accounts: {}", e);
                AccountStoreError::AccountsSerializationFailed { source: e }
            })?;

        tokio::fs::write(&self.path, toml)
            .await
            .context("Failed to write accounts.toml file")
            .map_err(|e| {
                error!(
                    "Failed to write accounts file {}: {}",
                    self.path.display(),
                    e
                );
                AccountStoreError::AccountsFileWriteFailed {
                    path: self.path.clone(),
                    source: e,
                }
            })?;

        info!(
            "Saved {} accounts to {}",
            self.accounts.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Add an account unless one of the same kind and identity exists
    pub fn add(&mut self, account: Account) -> bool {
        let exists = self
            .accounts
            .iter()
            .any(|a| a.kind() == account.kind() && a.identity() == account.identity());
        if exists {
            debug!(kind = %account.kind(), "Account already present");
            return false;
        }
        self.accounts.push(account);
        true
    }

    pub fn remove(&mut self, index: usize) -> Result<Account, AccountStoreError> {
        self.check_index(index)?;
        Ok(self.accounts.remove(index))
    }

    pub fn get(&self, index: usize) -> Option<&Account> {
        self.accounts.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut Account, AccountStoreError> {
        self.check_index(index)?;
        Ok(&mut self.accounts[index])
    }

    fn check_index(&self, index: usize) -> Result<(), AccountStoreError> {
        if index < self.accounts.len() {
            Ok(())
        } else {
            Err(AccountStoreError::AccountDoesntExist {
                tried_index: index,
                accounts_count: self.accounts.len(),
            })
        }
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inventory ids of every external account
    pub fn external_ids(&self) -> HashSet<String> {
        self.accounts
            .iter()
            .filter_map(|account| match account {
                Account::External(external) => Some(external.id.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{ExternalAccount, ExternalStrategy, RefreshTokenAccount, SessionTokenAccount};
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let temp_dir = tempdir().unwrap();
        let store = AccountStore::load(&temp_dir.path().join("accounts.toml"))
            .await
            .unwrap();
        assert_eq!(store.account_count(), 0);
    }

    #[tokio::test]
    async fn test_save_and_load_all_variants() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("accounts.toml");

        let mut store = AccountStore::load(&path).await.unwrap();
        assert!(store.add(RefreshTokenAccount::new("rt-1").into()));
        assert!(store.add(SessionTokenAccount::new("session-1").into()));
        assert!(store.add(
            ExternalAccount::new("inv-1")
                .with_strategy(ExternalStrategy::DerivedAccessToken)
                .into()
        ));
        store.save().await.unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("type = \"refresh-token\""));
        assert!(content.contains("strategy = \"derived-access-token\""));

        let loaded = AccountStore::load(&path).await.unwrap();
        assert_eq!(loaded.accounts(), store.accounts());
        assert_eq!(
            loaded.external_ids(),
            HashSet::from(["inv-1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_load_invalid_toml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("accounts.toml");
        fs::write(&path, "invalid toml content {{{").unwrap();

        let result = AccountStore::load(&path).await;
        if let Err(AccountStoreError::AccountsParsingFailed { path: failed, .. }) = result {
            assert_eq!(failed, path);
        } else {
            panic!("Expected AccountsParsingFailed error");
        }
    }

    #[tokio::test]
    async fn test_add_deduplicates_and_remove_checks_index() {
        let temp_dir = tempdir().unwrap();
        let mut store = AccountStore::load(&temp_dir.path().join("accounts.toml"))
            .await
            .unwrap();

        assert!(store.add(RefreshTokenAccount::new("same").into()));
        assert!(!store.add(RefreshTokenAccount::new("same").into()));
        assert!(store.add(SessionTokenAccount::new("same").into()));
        assert_eq!(store.account_count(), 2);

        if let Err(AccountStoreError::AccountDoesntExist {
            tried_index,
            accounts_count,
        }) = store.remove(5)
        {
            assert_eq!(tried_index, 5);
            assert_eq!(accounts_count, 2);
        } else {
            panic!("Expected AccountDoesntExist error");
        }

        let removed = store.remove(0).unwrap();
        assert_eq!(removed.identity(), "same");
        assert_eq!(store.account_count(), 1);
    }
}

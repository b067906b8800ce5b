//! Validator key management backed by a json key file.
#![warn(unused_crate_dependencies)]

pub use error::WalletError;
use dbft_hash::Hash;
use dbft_models::address::Address;
use dbft_signature::{KeyPair, PublicKey, Signature};
use std::collections::BTreeMap;
use std::path::PathBuf;

mod error;

/// Contains the secret keys available to this node.
#[derive(Clone)]
pub struct Wallet {
    /// own keypairs, indexed by the derived account address
    pub keys: BTreeMap<Address, KeyPair>,
    /// path to the json file the keys are loaded from and saved to
    pub wallet_path: PathBuf,
}

impl Wallet {
    /// Generates a new wallet initialized with the provided json file content
    pub fn new(path: PathBuf) -> Result<Wallet, WalletError> {
        let keypairs = if path.is_file() {
            serde_json::from_str::<Vec<KeyPair>>(&std::fs::read_to_string(&path)?)?
        } else {
            Vec::new()
        };
        let keys = keypairs
            .into_iter()
            .map(|keypair| {
                (
                    Address::from_public_key(&keypair.get_public_key()),
                    keypair,
                )
            })
            .collect();
        Ok(Wallet {
            keys,
            wallet_path: path,
        })
    }

    /// Signs a hash with the key of the given account, if owned.
    pub fn sign_hash(&self, address: Address, hash: &Hash) -> Option<Signature> {
        self.keys
            .get(&address)
            .and_then(|keypair| keypair.sign(hash).ok())
    }

    /// Adds a new keypair to the wallet, if it was missing
    pub fn add_keypair(&mut self, keypair: KeyPair) -> Result<Address, WalletError> {
        let address = Address::from_public_key(&keypair.get_public_key());
        if !self.keys.contains_key(&address) {
            self.keys.insert(address, keypair);
            self.save()?;
        }
        Ok(address)
    }

    /// Removes the key of the given account
    pub fn remove_address(&mut self, address: Address) -> Result<(), WalletError> {
        self.keys
            .remove(&address)
            .ok_or(WalletError::MissingKeyError(address))?;
        self.save()
    }

    /// Finds the keypair associated with given address
    pub fn find_associated_keypair(&self, address: &Address) -> Option<&KeyPair> {
        self.keys.get(address)
    }

    /// Finds the public key associated with given address
    pub fn find_associated_public_key(&self, address: &Address) -> Option<PublicKey> {
        self.keys.get(address).map(|kp| kp.get_public_key())
    }

    /// Among `validators`, finds the first one whose key is owned by this
    /// wallet. Returns its index in the list and the matching keypair.
    pub fn find_validator_key(&self, validators: &[PublicKey]) -> Option<(u8, KeyPair)> {
        validators.iter().enumerate().find_map(|(index, public_key)| {
            let address = Address::from_public_key(public_key);
            self.keys
                .get(&address)
                .map(|keypair| (index as u8, keypair.clone()))
        })
    }

    /// Save the wallet in json format in a file
    fn save(&self) -> Result<(), WalletError> {
        std::fs::write(
            &self.wallet_path,
            serde_json::to_string_pretty(&self.keys.values().collect::<Vec<_>>())?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wallet.json");
        let mut wallet = Wallet::new(path.clone()).unwrap();
        let keypair = KeyPair::generate();
        let address = wallet.add_keypair(keypair.clone()).unwrap();

        let reloaded = Wallet::new(path).unwrap();
        assert_eq!(reloaded.keys.len(), 1);
        assert_eq!(
            reloaded.find_associated_public_key(&address),
            Some(keypair.get_public_key())
        );
    }

    #[test]
    fn test_find_validator_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wallet.json");
        let mut wallet = Wallet::new(path).unwrap();
        let own = KeyPair::generate();
        wallet.add_keypair(own.clone()).unwrap();

        let validators = vec![
            KeyPair::generate().get_public_key(),
            own.get_public_key(),
            KeyPair::generate().get_public_key(),
        ];
        let (index, keypair) = wallet.find_validator_key(&validators).unwrap();
        assert_eq!(index, 1);
        assert_eq!(keypair.get_public_key(), own.get_public_key());

        let strangers = vec![KeyPair::generate().get_public_key()];
        assert!(wallet.find_validator_key(&strangers).is_none());
    }
}

// src/signature/mod.rs
//! Developer and store signatures

mod signing;
mod verify;

pub use signing::{SigningKeyPair, read_public_key_file};
pub use verify::{
    ChainOfTrust, KeyEndorsement, PackageSignature, VerifyError, hardware_bound_digest,
    verify_signature,
};

//! Key Generation Utility
//!
//! Generates an Ed25519 signing key for the mytoken server and prints it
//! as PKCS#8 PEM. The public key and its fingerprint go to stderr.
//!
//! Usage:
//!   mytoken-keygen > signing_key.pem

use mytoken::SigningKey;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let key = SigningKey::generate();
    let public = key.public_key();

    print!("{}", key.to_pem()?);
    eprintln!("fingerprint: {}", public.fingerprint());
    eprint!("{}", public.to_pem()?);
    Ok(())
}

use std::io::Write;

/// Run the `generate-key` subcommand.
pub fn generate(out: &mut impl Write) -> anyhow::Result<()> {
    let key = bs_core::vault::generate_master_key()?;
    writeln!(out, "{}", key.as_str())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bs_core::crypto::EncryptionKey;

    #[test]
    fn prints_a_usable_key() {
        let mut buf = Vec::new();
        generate(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(EncryptionKey::from_encoded(text.trim()).is_ok());
    }
}

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "Generate the Ed25519 account keypair for a storage miner")]
struct Args {
    /// Output directory for keypair file
    #[arg(short, long)]
    output: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let key = miner::helpers::generate_signing_key()?;

    std::fs::create_dir_all(&args.output)?;
    let keypair_path = args.output.join("keypair.bin");
    anyhow::ensure!(
        !keypair_path.exists(),
        "{} already exists, refusing to overwrite",
        keypair_path.display()
    );
    std::fs::write(&keypair_path, key.to_bytes())?;

    // The account id registered on chain
    println!("0x{}", hex::encode(key.verifying_key().as_bytes()));

    Ok(())
}

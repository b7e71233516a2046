use anyhow::Result;
use stun::client::StunClient;

pub fn run(address: &str) -> Result<()> {
    let server = if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:{}", address, stun::DEFAULT_PORT)
    };

    println!("Querying STUN server at {}...", server);
    let client = StunClient::new()?;
    let addr = client.get_public_address(&server)?;
    println!("Public address: {}", addr);
    Ok(())
}

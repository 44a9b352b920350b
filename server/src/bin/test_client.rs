//! Scripted exercise client for the match server.
//!
//! Connects, logs in, prints the USERS listing, optionally sends one
//! invitation, then prints every packet the server pushes until the
//! connection closes. Handy for poking a running server by hand:
//!
//! ```text
//! test_client 127.0.0.1:3333 alice
//! test_client 127.0.0.1:3333 bob --invite alice --role 1
//! ```

use clap::Parser;
use shared::game::GameRole;
use shared::protocol::{recv_packet, send_packet, PacketHeader, PacketType};
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[clap(about = "Scripted match-server test client")]
struct Args {
    /// Server address, e.g. 127.0.0.1:3333
    addr: String,

    /// Username to log in as
    username: String,

    /// Player to invite after logging in
    #[clap(long)]
    invite: Option<String>,

    /// Role offered to the invited player (1 or 2)
    #[clap(long, default_value_t = 2)]
    role: u8,
}

fn describe(kind: Option<PacketType>, raw: u8) -> String {
    match kind {
        Some(kind) => format!("{:?}", kind),
        None => format!("type {}", raw),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut stream = TcpStream::connect(&args.addr).await?;
    println!("connected to {}", args.addr);

    // Log in.
    send_packet(
        &mut stream,
        PacketHeader::new(PacketType::Login),
        args.username.as_bytes(),
    )
    .await?;
    let response = recv_packet(&mut stream)
        .await?
        .ok_or("server closed the connection")?;
    match response.header.packet_type() {
        Some(PacketType::Ack) => println!("logged in as {}", args.username),
        other => {
            println!("login refused ({})", describe(other, response.header.kind));
            return Ok(());
        }
    }

    // Ask who is here.
    send_packet(&mut stream, PacketHeader::new(PacketType::Users), &[]).await?;
    let response = recv_packet(&mut stream)
        .await?
        .ok_or("server closed the connection")?;
    println!("players online:");
    print!("{}", String::from_utf8_lossy(&response.payload));

    // Optionally invite someone.
    if let Some(target) = &args.invite {
        if GameRole::from_code(args.role).is_none() {
            return Err(format!("role must be 1 or 2, not {}", args.role).into());
        }
        let mut header = PacketHeader::new(PacketType::Invite);
        header.role = args.role;
        send_packet(&mut stream, header, target.as_bytes()).await?;
        let response = recv_packet(&mut stream)
            .await?
            .ok_or("server closed the connection")?;
        match response.header.packet_type() {
            Some(PacketType::Ack) => {
                println!("invited {} (invitation id {})", target, response.header.id)
            }
            other => println!(
                "invitation refused ({})",
                describe(other, response.header.kind)
            ),
        }
    }

    // Print whatever the server pushes until it hangs up.
    println!("waiting for server packets (ctrl-c to quit)...");
    while let Some(packet) = recv_packet(&mut stream).await? {
        let header = packet.header;
        println!(
            "<= {} id={} role={}",
            describe(header.packet_type(), header.kind),
            header.id,
            header.role
        );
        if !packet.payload.is_empty() {
            println!("{}", String::from_utf8_lossy(&packet.payload));
        }
    }
    println!("server closed the connection");
    Ok(())
}

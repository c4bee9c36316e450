#[macro_use]
extern crate error_chain;

use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, Command};

use consensus::node::{Node, NodeConfig, Protocol};
use consensus::protos::ServerId;

mod errors {
	error_chain! {
		links {
			Consensus(consensus::errors::Error, consensus::errors::ErrorKind);
		}
		foreign_links {
			Io(std::io::Error);
		}
	}
}

use errors::*;

fn parse_protocol(name: &str) -> Protocol {
	match name {
		"bft" => Protocol::Pbft,
		_ => Protocol::Raft,
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.init();

	let matches = Command::new("consensusd")
		.about("Replicated key-value node speaking either crash-fault or byzantine agreement")
		.arg(
			Arg::new("id")
				.long("id")
				.value_name("SERVER_ID")
				.value_parser(value_parser!(u64))
				.required(true)
				.help("Unique id of this server; must appear in the cluster config"),
		)
		.arg(
			Arg::new("config")
				.long("config")
				.short('c')
				.value_name("FILE_PATH")
				.required(true)
				.help("JSON cluster configuration listing every peer as {id, ip, port}"),
		)
		.arg(
			Arg::new("dir")
				.long("dir")
				.short('d')
				.value_name("DIRECTORY_PATH")
				.required(true)
				.help("Directory to store durable state for this unique instance"),
		)
		.arg(
			Arg::new("protocol")
				.long("protocol")
				.value_parser(["raft", "bft"])
				.default_value("raft")
				.help("Which replication protocol this cluster runs"),
		)
		.arg(
			Arg::new("malicious")
				.long("malicious")
				.action(ArgAction::SetTrue)
				.help("Deliberately violate the byzantine protocol (fault injection for tests)"),
		)
		.get_matches();

	let id: ServerId = *matches.get_one::<u64>("id").unwrap();
	let config_path = PathBuf::from(matches.get_one::<String>("config").unwrap());
	let dir = PathBuf::from(matches.get_one::<String>("dir").unwrap());
	let protocol = parse_protocol(matches.get_one::<String>("protocol").unwrap());
	let malicious = matches.get_flag("malicious");

	let node = Node::start(NodeConfig { id, dir, config_path, protocol, malicious }).await?;

	tokio::signal::ctrl_c().await?;
	node.shutdown();

	Ok(())
}

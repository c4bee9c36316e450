#[macro_use]
extern crate error_chain;

pub mod errors {
	error_chain! {
		foreign_links {
			Io(std::io::Error);
			Json(serde_json::Error);
			Encode(rmp_serde::encode::Error);
			Decode(rmp_serde::decode::Error);
		}
	}
}

pub mod protos;
pub mod config;
pub mod log;
mod state;
pub mod consensus;
pub mod atomic;
pub mod state_machine;
pub mod rpc;
pub mod server;
pub mod bft;
pub mod bft_server;
pub mod node;

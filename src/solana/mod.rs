// Re-export everything from submodules
pub mod amounts;
pub mod rpc;
pub mod wallet;

// Re-export commonly used items
pub use amounts::{lamports_to_sol, sol_to_lamports, LAMPORTS_PER_SOL};
pub use rpc::create_rpc_client;
pub use wallet::{keypair_from_base58, keypair_to_base58, parse_pubkey};

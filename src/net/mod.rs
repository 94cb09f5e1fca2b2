pub mod codec;
pub mod session;
pub mod sio;
#[cfg(test)]
pub(crate) mod testing;
pub mod tls;
pub mod ws;
pub mod xor;

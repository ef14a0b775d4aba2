//! Static rewriter for 64-bit PE images.
//!
//! Decomposes a compiled executable or DLL into relocatable blocks and
//! streams an equivalent, immediately executable program into
//! caller-provided memory regions, recomputing every RIP-relative
//! displacement along the way. The caller owns all target memory and
//! supplies the import callbacks; the rewriter never allocates executable
//! memory itself.

pub mod block;
pub mod codec;
pub mod disasm;
pub mod emit;
pub mod error;
pub mod image;
pub mod imports;
pub mod rewriter;

pub use block::{BlockKind, Blocks, CodeBlock, DataBlock};
pub use emit::MemoryRegion;
pub use error::{Phase, Result, RewriteError};
pub use image::Image;
pub use imports::ImportResolver;
pub use rewriter::Rewriter;

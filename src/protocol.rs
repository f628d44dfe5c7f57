//! Shared protocol constants for the remexec framed transport

// Protocol header constant; there is no version field
pub const MAGIC: &[u8; 4] = b"RMX1";

// Frame header size: MAGIC (4) | KIND (1) | LENGTH (4)
pub const HEADER_LEN: usize = 9;

// Maximum frame payload size (16MB) - prevents memory exhaustion from a bogus length
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Default listening port for both daemon and client
pub const DEFAULT_PORT: u16 = 8080;

// Longest request line accepted on either side
pub const LINE_MAX: usize = 512;

// Default capacity of one FileBlock. Files longer than this are cut at the boundary.
pub const FILE_BLOCK_SIZE: usize = 40960;

// Default cap on captured command output carried by one reply, footer excluded
pub const REPLY_LIMIT: usize = 40960;

// The client pauses `get` output after this many lines
pub const PAGE_LINES: usize = 40;

// Name of the cached binary inside a program directory
pub const BINARY_NAME: &str = "main";

// Frame type IDs
pub mod frame {
    /// Raw command line, client -> server
    pub const REQUEST: u8 = 1;
    /// Text reply, server -> client
    pub const REPLY: u8 = 2;
    /// One FileBlock, client -> server during `put`
    pub const BLOCK: u8 = 3;
    /// Closes the replies belonging to one request
    pub const DONE: u8 = 4;
}

// Centralized timeout constants
pub mod timeouts {
    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 500;

    // Base timeout for reading a FileBlock during put (ms)
    pub const BLOCK_READ_BASE_MS: u64 = 5_000;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 1;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 2_000;

    // Calculate write deadline based on payload size (ms)
    // 500ms base + 1ms per 1MB payload (ceil)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64).div_ceil(1_048_576);
        WRITE_BASE_MS + mb * PER_MB_MS
    }

    // Calculate block read deadline based on payload size (ms)
    pub fn block_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64).div_ceil(1_048_576);
        BLOCK_READ_BASE_MS + mb * PER_MB_MS
    }
}

/// Usage text shared by the client's local rejection and the server's usage reply.
pub const USAGE: &str = "Command is malformed or not accepted.\nPlease use the following:\n\
* put progname sourcefile[s] [-f]\n\
* get progname sourcefile\n\
* list [-l] progname\n\
* run progname [args] [-f localfile]\n\
* sys\n\
* quit\n";

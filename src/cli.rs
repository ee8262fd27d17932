use structopt::StructOpt;

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Erase the IMU and sync log regions, keeping tail storage intact
    Erase,
    /// Erase the entire chip, including tail storage
    EraseAll,
    /// Start a recording session, optionally bounded to a page count
    Record {
        #[structopt(long)]
        pages: Option<u32>,
    },
    /// Stream the IMU log as ASCII, optionally bounded to a page count
    Dump {
        #[structopt(long)]
        pages: Option<u32>,
    },
    /// Stream the sync log as ASCII
    Sdump,
    /// Write an ASCII payload into a tail-storage slot (1..=255)
    Store {
        slot: u16,
        text: String,
    },
    /// Read a tail-storage slot (0..=255) and print it as hex
    Read {
        slot: u16,
    },
    /// Service one live-frame probe and print the result as ASCII
    Frame,
    /// Service one live-frame probe and print the result as binary (hex)
    Aframe,
    /// Print geometry, mode, and counters
    Status,
    /// Parse a hex-encoded beacon payload and feed it through the
    /// receiver policy, scan scheduler, and recording engine coordinator
    Beacon {
        /// Hex-encoded beacon payload (post company-id)
        payload: String,
        /// Local monotonic "rtc" timestamp at reception, in milliseconds
        rtc_ms: u32,
        /// Hex-encoded 16-byte AES-128 key, for authenticated beacons
        #[structopt(long)]
        key: Option<String>,
    },
}

#[derive(StructOpt, Debug)]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// Backing file for the emulated flash image
    #[structopt(env = "LMT_IMAGE", long = "image", default_value = "lmt-logger.img")]
    pub image_path: std::path::PathBuf,

    /// Capacity of the emulated flash image in pages (rounded up to a
    /// power of two)
    #[structopt(env = "LMT_PAGES", long = "pages", default_value = "8448")]
    pub capacity_pages: u32,
}

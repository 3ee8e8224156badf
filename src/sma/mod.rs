pub mod address;    // Device addresses and serials
pub mod data_point; // Telemetry dictionary and query groups
pub mod decoder;    // Telemetry record decoding
pub mod frame;      // Framing, byte stuffing and checksums
pub mod packet;     // Frame and level-2 header layouts, requests
pub mod session;    // Discovery, logon, query and logoff
pub mod transport;  // Byte stream to the plant

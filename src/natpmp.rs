//! NAT-PMP client message encoding and decoding.
//!
//! Wire layout per [RFC 6886]. Only the client side of the exchange lives
//! here; putting these bytes on the network is the network gateway's job.
//!
//! [RFC 6886]: https://datatracker.ietf.org/doc/html/rfc6886

use std::net::Ipv4Addr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Port the gateway listens on for NAT-PMP (and PCP) requests.
pub const SERVER_PORT: u16 = 5351;

/// Recommended lifetime for a requested mapping, two hours.
///
/// See <https://datatracker.ietf.org/doc/html/rfc6886#section-3.3>.
pub const RECOMMENDED_MAPPING_LIFETIME_SECONDS: u32 = 60 * 60 * 2;

/// NAT-PMP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    /// The only version defined by RFC 6886.
    NatPmp = 0,
}

/// Operation requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Ask the gateway for its external address.
    DetermineExternalAddress = 0,
    /// Map a UDP port.
    MapUdp = 1,
    /// Map a TCP port.
    MapTcp = 2,
}

/// Transport protocol of a requested mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapProtocol {
    /// UDP mapping.
    Udp,
    /// TCP mapping.
    Tcp,
}

impl MapProtocol {
    fn opcode(&self) -> Opcode {
        match self {
            MapProtocol::Udp => Opcode::MapUdp,
            MapProtocol::Tcp => Opcode::MapTcp,
        }
    }
}

/// A NAT-PMP request.
#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    /// Request to determine the gateway's external address.
    ExternalAddress,
    /// Request to register a mapping with the gateway.
    Mapping {
        /// Protocol to map.
        proto: MapProtocol,
        /// Local port to map.
        local_port: u16,
        /// Preferred external port, 0 for no preference.
        external_port: u16,
        /// Requested lifetime in seconds; 0 deletes the mapping.
        lifetime_seconds: u32,
    },
}

impl Request {
    /// Encode this [`Request`].
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::ExternalAddress => vec![
                Version::NatPmp.into(),
                Opcode::DetermineExternalAddress.into(),
            ],
            Request::Mapping {
                proto,
                local_port,
                external_port,
                lifetime_seconds,
            } => {
                let mut buf = vec![Version::NatPmp.into(), proto.opcode().into()];
                buf.push(0); // reserved
                buf.push(0); // reserved
                buf.extend_from_slice(&local_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
                buf
            }
        }
    }

    #[cfg(test)]
    fn random<R: rand::Rng>(opcode: Opcode, rng: &mut R) -> Self {
        let proto = match opcode {
            Opcode::DetermineExternalAddress => return Request::ExternalAddress,
            Opcode::MapUdp => MapProtocol::Udp,
            Opcode::MapTcp => MapProtocol::Tcp,
        };
        Request::Mapping {
            proto,
            local_port: rng.gen(),
            external_port: rng.gen(),
            lifetime_seconds: rng.gen(),
        }
    }

    #[cfg(test)]
    #[track_caller]
    fn decode(buf: &[u8]) -> Self {
        let _version: Version = buf[0].try_into().unwrap();
        let opcode: Opcode = buf[1].try_into().unwrap();
        let proto = match opcode {
            Opcode::DetermineExternalAddress => return Request::ExternalAddress,
            Opcode::MapUdp => MapProtocol::Udp,
            Opcode::MapTcp => MapProtocol::Tcp,
        };
        // buf[2..4] reserved
        let local_port = u16::from_be_bytes(buf[4..6].try_into().unwrap());
        let external_port = u16::from_be_bytes(buf[6..8].try_into().unwrap());
        let lifetime_seconds = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        Request::Mapping {
            proto,
            local_port,
            external_port,
            lifetime_seconds,
        }
    }
}

/// Result of a request, as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum ResultCode {
    /// The request succeeded.
    Success = 0,
    /// The server does not speak this protocol version.
    UnsupportedVersion = 1,
    /// Mapping is supported but administratively disabled.
    NotAuthorizedOrRefused = 2,
    /// The gateway itself has no working external connectivity.
    NetworkFailure = 3,
    /// The gateway cannot create more mappings at this time.
    OutOfResources = 4,
    /// The server does not implement the requested opcode.
    UnsupportedOpcode = 5,
}

/// Errors produced when decoding a [`Response`].
#[derive(Debug, derive_more::Display, thiserror::Error)]
pub enum Error {
    /// Response is too short or otherwise malformed.
    #[display("response is malformed")]
    Malformed,
    /// The response indicator bit is not present.
    #[display("packet is not a response")]
    NotAResponse,
    /// The opcode is none of the defined ones.
    #[display("invalid opcode received")]
    InvalidOpcode,
    /// The version is not NAT-PMP's.
    #[display("invalid version received")]
    InvalidVersion,
    /// The result code is none of the defined ones.
    #[display("invalid result code received")]
    InvalidResultCode,
    /// Server rejection, see [`ResultCode::UnsupportedVersion`].
    UnsupportedVersion,
    /// Server rejection, see [`ResultCode::NotAuthorizedOrRefused`].
    NotAuthorizedOrRefused,
    /// Server rejection, see [`ResultCode::NetworkFailure`].
    NetworkFailure,
    /// Server rejection, see [`ResultCode::OutOfResources`].
    OutOfResources,
    /// Server rejection, see [`ResultCode::UnsupportedOpcode`].
    UnsupportedOpcode,
}

/// A NAT-PMP response with a success result code.
#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    /// The gateway's external address.
    PublicAddress {
        /// Seconds since the mapping table was last reset.
        epoch_time: u32,
        /// External address of the gateway.
        public_ip: Ipv4Addr,
    },
    /// A registered mapping.
    PortMap {
        /// Protocol that was mapped.
        proto: MapProtocol,
        /// Seconds since the mapping table was last reset.
        epoch_time: u32,
        /// Local port of the mapping.
        private_port: u16,
        /// External port assigned by the gateway.
        external_port: u16,
        /// Lifetime granted by the gateway, in seconds.
        lifetime_seconds: u32,
    },
}

impl Response {
    /// Size of an encoded external address response.
    pub const PUBLIC_ADDRESS_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        4; // public ip

    /// Size of an encoded mapping response.
    pub const PORT_MAP_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        2 + // private port
        2 + // external port
        4; // lifetime

    /// Indicator ORd into the [`Opcode`] to mark a response packet.
    pub const INDICATOR: u8 = 1u8 << 7;

    /// Decode a response, validating version, indicator and result code.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::PUBLIC_ADDRESS_SIZE || buf.len() > Self::PORT_MAP_SIZE {
            return Err(Error::Malformed);
        }
        let _: Version = buf[0].try_into().map_err(|_| Error::InvalidVersion)?;
        let opcode = buf[1];
        if opcode & Self::INDICATOR != Self::INDICATOR {
            return Err(Error::NotAResponse);
        }
        let opcode: Opcode = (opcode & !Self::INDICATOR)
            .try_into()
            .map_err(|_| Error::InvalidOpcode)?;

        let result_bytes = u16::from_be_bytes(buf[2..4].try_into().expect("slice has the right len"));
        let result_code: ResultCode = result_bytes
            .try_into()
            .map_err(|_| Error::InvalidResultCode)?;
        match result_code {
            ResultCode::Success => Ok(()),
            ResultCode::UnsupportedVersion => Err(Error::UnsupportedVersion),
            ResultCode::NotAuthorizedOrRefused => Err(Error::NotAuthorizedOrRefused),
            ResultCode::NetworkFailure => Err(Error::NetworkFailure),
            ResultCode::OutOfResources => Err(Error::OutOfResources),
            ResultCode::UnsupportedOpcode => Err(Error::UnsupportedOpcode),
        }?;

        let epoch_time = u32::from_be_bytes(buf[4..8].try_into().expect("slice has the right len"));

        let response = match opcode {
            Opcode::DetermineExternalAddress => {
                if buf.len() != Self::PUBLIC_ADDRESS_SIZE {
                    return Err(Error::Malformed);
                }
                let ip_bytes: [u8; 4] = buf[8..12].try_into().expect("slice has the right len");
                Response::PublicAddress {
                    epoch_time,
                    public_ip: ip_bytes.into(),
                }
            }
            Opcode::MapUdp | Opcode::MapTcp => {
                if buf.len() != Self::PORT_MAP_SIZE {
                    return Err(Error::Malformed);
                }
                let proto = match opcode {
                    Opcode::MapUdp => MapProtocol::Udp,
                    _ => MapProtocol::Tcp,
                };
                let private_port =
                    u16::from_be_bytes(buf[8..10].try_into().expect("slice has the right len"));
                let external_port =
                    u16::from_be_bytes(buf[10..12].try_into().expect("slice has the right len"));
                let lifetime_seconds =
                    u32::from_be_bytes(buf[12..16].try_into().expect("slice has the right len"));
                Response::PortMap {
                    proto,
                    epoch_time,
                    private_port,
                    external_port,
                    lifetime_seconds,
                }
            }
        };
        Ok(response)
    }
}

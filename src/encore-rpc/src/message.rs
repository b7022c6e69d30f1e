//! Typed requests and one-way events.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A request with a typed response, routed to the peer endpoint named by
/// [`Request::endpoint`].
///
/// ```
/// use encore_rpc::Request;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Echo {
///     text: String,
/// }
///
/// impl Request for Echo {
///     type Response = Echo;
/// }
///
/// assert_eq!(Echo::endpoint(), "Echo");
/// ```
pub trait Request: Serialize + DeserializeOwned + Send + 'static {
    type Response: Serialize + DeserializeOwned + Send + 'static;

    /// Stable endpoint name. Defaults to the type's own name; override it
    /// when two request types would otherwise collide.
    fn endpoint() -> &'static str {
        short_type_name::<Self>()
    }
}

/// A fire-and-forget event delivered to every subscriber on the peer.
pub trait Postable: Serialize + DeserializeOwned + Send + 'static {
    fn name() -> &'static str {
        short_type_name::<Self>()
    }
}

/// The last path segment of `T`'s type name, without generic arguments.
///
/// `encore_extension::protocol::PingHost` becomes `PingHost` and
/// `my::Page<my::Track>` becomes `Page`.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct NowPlaying;

    impl Request for NowPlaying {
        type Response = Option<String>;
    }

    #[derive(Serialize, Deserialize)]
    struct Renamed;

    impl Request for Renamed {
        type Response = ();

        fn endpoint() -> &'static str {
            "player.NowPlaying"
        }
    }

    #[derive(Serialize, Deserialize)]
    struct VolumeChanged {
        level: u8,
    }

    impl Postable for VolumeChanged {}

    #[derive(Serialize, Deserialize)]
    struct Page<T> {
        items: Vec<T>,
    }

    #[test]
    fn default_names_use_the_last_path_segment() {
        assert_eq!(NowPlaying::endpoint(), "NowPlaying");
        assert_eq!(VolumeChanged::name(), "VolumeChanged");
    }

    #[test]
    fn generic_arguments_are_stripped() {
        assert_eq!(short_type_name::<Page<VolumeChanged>>(), "Page");
        assert_eq!(short_type_name::<u32>(), "u32");
    }

    #[test]
    fn explicit_names_win() {
        assert_eq!(Renamed::endpoint(), "player.NowPlaying");
    }
}

use std::fmt;

/// Kind of media a command consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFamily {
    Video,
    /// Any image except animated GIF.
    StillImage,
}

impl MediaFamily {
    pub fn noun(self) -> &'static str {
        match self {
            MediaFamily::Video => "video",
            MediaFamily::StillImage => "image",
        }
    }

    /// Checks a declared content type such as `video/mp4; codecs=avc1`.
    pub fn accepts_mime(self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match self {
            MediaFamily::Video => essence.starts_with("video/"),
            MediaFamily::StillImage => essence.starts_with("image/") && essence != "image/gif",
        }
    }

    /// Checks a probed codec name such as `h264` or `png`.
    pub fn accepts_encoding(self, encoding: &str) -> bool {
        match self {
            MediaFamily::Video => true,
            MediaFamily::StillImage => {
                !encoding.is_empty() && !encoding.eq_ignore_ascii_case("gif")
            }
        }
    }
}

impl fmt::Display for MediaFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.noun())
    }
}

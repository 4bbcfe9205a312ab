//! Application to container image mapping

use tracing::{debug, warn};

use crate::config::ImageConfig;

/// Image chosen for an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedImage {
    pub reference: String,
    /// The application was unknown and the office image was used instead
    pub fallback: bool,
}

/// Maps application identifiers to image references
#[derive(Debug, Clone)]
pub struct ImageSelector {
    images: ImageConfig,
}

impl ImageSelector {
    pub fn new(images: ImageConfig) -> Self {
        Self { images }
    }

    /// Select the image for the primary application identifier.
    ///
    /// Unknown applications get the office image.
    pub fn select(&self, application: &str) -> SelectedImage {
        let known = match application {
            "writer" | "presentation" | "calc" => Some(&self.images.office),
            "mail" => Some(&self.images.mail),
            "gimp" => Some(&self.images.editor),
            _ => None,
        };

        let selected = match known {
            Some(image) => SelectedImage {
                reference: image.clone(),
                fallback: false,
            },
            None => {
                warn!(
                    application = %application,
                    image = %self.images.office,
                    "Unknown application, launching the default office image"
                );
                crate::metrics::record_unknown_application(application);
                SelectedImage {
                    reference: self.images.office.clone(),
                    fallback: true,
                }
            }
        };

        debug!(application = %application, image = %selected.reference, "Image selected");
        selected
    }
}

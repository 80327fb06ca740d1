use sha2::{Digest, Sha256};

use super::models::Ad;

/// SHA-256 over the user-visible fields of an ad.
///
/// Every field is written as `name`, byte length and bytes, so two different
/// field tuples never produce the same input stream.
pub fn content_hash(ad: &Ad) -> String {
    let mut hasher = FramedHasher::default();
    hasher.field("title", &ad.title);
    hasher.field("description", &ad.description);
    hasher.field("type", ad.ad_type.as_str());
    hasher.field("category", ad.category.as_deref().unwrap_or(""));
    hasher.field(
        "price",
        &ad.price.map(|price| price.canonical()).unwrap_or_default(),
    );
    hasher.field("price_type", ad.price_type.as_str());
    hasher.field("condition", ad.condition.map(|c| c.as_str()).unwrap_or(""));
    hasher.field("shipping_type", ad.shipping_type.as_str());
    hasher.field(
        "shipping_costs",
        &ad.shipping_costs
            .map(|price| price.canonical())
            .unwrap_or_default(),
    );
    for option in &ad.shipping_options {
        hasher.field("shipping_option", option);
    }
    hasher.field("sell_directly", if ad.sell_directly { "true" } else { "false" });
    for (key, value) in &ad.attributes {
        hasher.field("attribute", key);
        hasher.field("attribute_value", value);
    }
    let base = ad.source.parent();
    for image in &ad.images {
        let relative = base
            .and_then(|dir| image.strip_prefix(dir).ok())
            .unwrap_or(image.as_path());
        hasher.field("image", &relative.to_string_lossy());
    }
    hasher.finish()
}

#[derive(Default)]
struct FramedHasher {
    inner: Sha256,
}

impl FramedHasher {
    fn field(&mut self, name: &str, value: &str) {
        self.frame(name.as_bytes());
        self.frame(value.as_bytes());
    }

    fn frame(&mut self, bytes: &[u8]) {
        self.inner.update((bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
    }

    fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

use crate::core::model::Quality;
use crate::plugins::registry::ResourceResolver;
use url::Url;

/// `{base}/{reciter}/verse/{item}?quality={quality}`
pub struct TemplateResolver {
    base: Url,
    reciter: String,
}

impl TemplateResolver {
    pub fn new(base: &str, reciter: &str) -> anyhow::Result<Self> {
        let base = Url::parse(base)?;
        if base.scheme() != "http" && base.scheme() != "https" {
            anyhow::bail!("unsupported scheme for base url: {}", base.scheme());
        }
        if base.cannot_be_a_base() {
            anyhow::bail!("base url cannot carry a path: {}", base);
        }
        let reciter = reciter.trim();
        if reciter.is_empty() {
            anyhow::bail!("reciter must not be empty");
        }
        Ok(Self { base, reciter: reciter.to_string() })
    }
}

impl ResourceResolver for TemplateResolver {
    fn name(&self) -> &'static str {
        "template-resolver"
    }

    fn resolve(&self, item_id: &str, quality: Quality) -> anyhow::Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segs = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("base url cannot carry a path"))?;
            segs.pop_if_empty();
            segs.push(&self.reciter);
            segs.push("verse");
            segs.push(item_id);
        }
        url.query_pairs_mut().clear().append_pair("quality", quality.as_str());
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_verse_url() {
        let r = TemplateResolver::new("https://api.example.com/quran/audio", "alafasy").unwrap();
        let url = r.resolve("255", Quality::High).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/quran/audio/alafasy/verse/255?quality=high");
    }

    #[test]
    fn trailing_slash_and_odd_ids_are_handled() {
        let r = TemplateResolver::new("http://localhost:8080/audio/", "husary").unwrap();
        let url = r.resolve("a b", Quality::Low).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/audio/husary/verse/a%20b?quality=low");
    }

    #[test]
    fn rejects_non_http_base() {
        assert!(TemplateResolver::new("ftp://example.com/x", "r").is_err());
        assert!(TemplateResolver::new("mailto:someone@example.com", "r").is_err());
        assert!(TemplateResolver::new("https://example.com", "  ").is_err());
    }
}

//! Turns a Reader document into a file rmapi can upload: articles become
//! EPUBs with remote images embedded, PDFs are fetched from their source URL
//! as-is.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use epub_builder::{EpubBuilder, EpubContent, ReferenceType, ZipLibrary};
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use regex::Regex;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::readwise::{retry_after, Document, RequestPacer};

/// Image hosts get one request per second at most.
const IMAGE_REQUEST_INTERVAL: Duration = Duration::from_secs(1);
const IMAGE_MAX_RETRIES: u32 = 3;
const IMAGE_RETRY_DELAY: Duration = Duration::from_secs(2);
const IMAGE_TIMEOUT: Duration = Duration::from_secs(15);
const PDF_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = "Mozilla/5.0 (compatible; ReaderSync/0.1)";

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("document has no HTML content")]
    MissingContent,
    #[error("PDF document has no source URL")]
    MissingSourceUrl,
    #[error("failed to construct HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("EPUB generation failed: {0}")]
    Epub(String),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Produces an uploadable file for a document. Mockable so the orchestrator
/// can be tested without network access.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Converter: Send + Sync {
    /// Write the document's uploadable form into `out_dir` and return its path.
    async fn prepare(&self, document: &Document, out_dir: &Path)
        -> Result<PathBuf, ConvertError>;
}

/// Strips characters that are invalid in file names and collapses whitespace.
pub fn clean_filename(title: &str) -> String {
    const INVALID: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let cleaned: String = title.chars().filter(|c| !INVALID.contains(c)).collect();
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        "Untitled".to_string()
    } else {
        cleaned
    }
}

struct EmbeddedImage {
    name: String,
    mime: &'static str,
    bytes: Vec<u8>,
}

pub struct DocumentConverter {
    http: reqwest::Client,
    image_pacer: RequestPacer,
    img_src: Regex,
    body: Regex,
}

impl DocumentConverter {
    pub fn new() -> Result<Self, ConvertError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(ConvertError::Client)?;

        Ok(Self {
            http,
            image_pacer: RequestPacer::new(IMAGE_REQUEST_INTERVAL),
            img_src: Regex::new(r#"<img[^>]*\ssrc\s*=\s*["']([^"']+)["']"#)?,
            body: Regex::new(r"(?is)<body[^>]*>(.*)</body>")?,
        })
    }

    async fn download_pdf(
        &self,
        document: &Document,
        out_dir: &Path,
    ) -> Result<PathBuf, ConvertError> {
        let url = document
            .source_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or(ConvertError::MissingSourceUrl)?;
        let path = out_dir.join(format!("{}.pdf", clean_filename(document.title())));

        info!(title = document.title(), url, "Downloading PDF");
        let response = self
            .http
            .get(url)
            .timeout(PDF_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| ConvertError::Fetch {
                url: url.to_string(),
                source,
            })?;
        let bytes = response.bytes().await.map_err(|source| ConvertError::Fetch {
            url: url.to_string(),
            source,
        })?;

        std::fs::write(&path, &bytes)?;
        info!(path = %path.display(), size = bytes.len(), "Saved PDF");
        Ok(path)
    }

    async fn html_to_epub(
        &self,
        document: &Document,
        out_dir: &Path,
    ) -> Result<PathBuf, ConvertError> {
        let html = document
            .html_content
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or(ConvertError::MissingContent)?;

        let title = document.title();
        let path = out_dir.join(format!("{}.epub", clean_filename(title)));

        // Work on the body markup only, if the content has a full document.
        let body = self
            .body
            .captures(html)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| html.to_string());
        let (body, images) = self.embed_images(&body).await;

        let mut builder =
            EpubBuilder::new(ZipLibrary::new().map_err(epub_err)?).map_err(epub_err)?;
        builder.metadata("title", title).map_err(epub_err)?;
        if let Some(author) = document.author() {
            builder.metadata("author", author).map_err(epub_err)?;
        }
        for image in &images {
            builder
                .add_resource(&image.name, image.bytes.as_slice(), image.mime)
                .map_err(epub_err)?;
        }

        let chapter = chapter_xhtml(title, document.author(), &body);
        builder
            .add_content(
                EpubContent::new("content.xhtml", chapter.as_bytes())
                    .title(title)
                    .reftype(ReferenceType::Text),
            )
            .map_err(epub_err)?;

        let mut file = std::fs::File::create(&path)?;
        builder.generate(&mut file).map_err(epub_err)?;

        info!(
            path = %path.display(),
            images = images.len(),
            "Generated EPUB"
        );
        Ok(path)
    }

    /// Fetches every remote image referenced by the HTML and rewrites the
    /// matching `<img>` `src` attributes to names local to the EPUB. A failed
    /// image is left untouched; hrefs and prose mentioning the URL stay as
    /// they are.
    async fn embed_images(&self, html: &str) -> (String, Vec<EmbeddedImage>) {
        let mut urls: Vec<String> = Vec::new();
        for captures in self.img_src.captures_iter(html) {
            let url = captures[1].to_string();
            if (url.starts_with("http://") || url.starts_with("https://"))
                && !urls.contains(&url)
            {
                urls.push(url);
            }
        }
        if !urls.is_empty() {
            debug!(count = urls.len(), "Embedding remote images");
        }

        let mut images = Vec::new();
        let mut local_names: HashMap<String, String> = HashMap::new();
        for (index, url) in urls.iter().enumerate() {
            match self.fetch_image(url).await {
                Some(bytes) => {
                    let ext = image_extension(url, &bytes);
                    let name = format!("img_{index}.{ext}");
                    local_names.insert(url.clone(), name.clone());
                    images.push(EmbeddedImage {
                        mime: mime_for(&ext),
                        name,
                        bytes,
                    });
                }
                None => warn!(url, "Skipping image that could not be fetched"),
            }
        }

        // Swap each captured src for its local name, keyed on the exact
        // captured URL so one URL being a prefix of another cannot corrupt
        // the rewrite.
        let rewritten = self
            .img_src
            .replace_all(html, |caps: &regex::Captures| {
                let tag = &caps[0];
                if let (Some(whole), Some(group)) = (caps.get(0), caps.get(1)) {
                    let start = group.start() - whole.start();
                    let end = group.end() - whole.start();
                    if let Some(name) = local_names.get(&tag[start..end]) {
                        return format!(
                            "{}{}{} style=\"max-width: 100%; height: auto;\"",
                            &tag[..start],
                            name,
                            &tag[end..]
                        );
                    }
                }
                tag.to_string()
            })
            .into_owned();

        (rewritten, images)
    }

    async fn fetch_image(&self, url: &str) -> Option<Vec<u8>> {
        let mut delay = IMAGE_RETRY_DELAY;

        for attempt in 1..=IMAGE_MAX_RETRIES {
            self.image_pacer.wait().await;

            match self.http.get(url).timeout(IMAGE_TIMEOUT).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let wait = retry_after(&response).unwrap_or(delay);
                        warn!(
                            url,
                            attempt,
                            wait_secs = wait.as_secs(),
                            "Image host rate limited, backing off"
                        );
                        sleep(wait).await;
                    } else if status == StatusCode::FORBIDDEN {
                        // Usually hotlink protection; not worth retrying.
                        warn!(url, "Image host denied access");
                        return None;
                    } else if !status.is_success() {
                        warn!(url, %status, attempt, "Image fetch returned error status");
                        sleep(delay).await;
                    } else {
                        match response.bytes().await {
                            Ok(bytes) => return Some(bytes.to_vec()),
                            Err(error) => {
                                warn!(url, attempt, %error, "Failed to read image body");
                                sleep(delay).await;
                            }
                        }
                    }
                }
                Err(error) => {
                    warn!(url, attempt, %error, "Image fetch failed");
                    sleep(delay).await;
                }
            }

            delay *= 2;
        }
        None
    }
}

#[async_trait]
impl Converter for DocumentConverter {
    async fn prepare(
        &self,
        document: &Document,
        out_dir: &Path,
    ) -> Result<PathBuf, ConvertError> {
        match document.category.as_deref() {
            Some("pdf") => self.download_pdf(document, out_dir).await,
            _ => self.html_to_epub(document, out_dir).await,
        }
    }
}

fn epub_err<E: std::fmt::Display>(error: E) -> ConvertError {
    ConvertError::Epub(error.to_string())
}

fn chapter_xhtml(title: &str, author: Option<&str>, body: &str) -> String {
    let mut content = format!("<h1>{}</h1>", escape_html(title));
    if let Some(author) = author {
        content.push_str(&format!("<p><em>by {}</em></p><hr/>", escape_html(author)));
    }
    content.push_str(body);

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <html xmlns=\"http://www.w3.org/1999/xhtml\">\n\
         <head><title>{}</title></head>\n\
         <body>{}</body>\n\
         </html>",
        escape_html(title),
        content
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Picks a file extension by sniffing magic bytes, falling back to the URL
/// extension and finally to jpg.
fn image_extension(url: &str, content: &[u8]) -> String {
    if content.starts_with(b"\x89PNG") {
        return "png".to_string();
    }
    if content.starts_with(&[0xff, 0xd8, 0xff]) {
        return "jpg".to_string();
    }
    if content.starts_with(b"GIF") {
        return "gif".to_string();
    }
    if content.starts_with(b"RIFF") && content.len() >= 12 && &content[8..12] == b"WEBP" {
        return "webp".to_string();
    }
    let head = &content[..content.len().min(100)];
    if head.windows(4).any(|w| w == b"<svg") {
        return "svg".to_string();
    }

    if let Some((_, tail)) = url.rsplit_once('.') {
        let ext = tail.split('?').next().unwrap_or("").to_ascii_lowercase();
        if ["png", "gif", "webp", "svg", "jpeg", "bmp"].contains(&ext.as_str()) {
            return if ext == "jpeg" { "jpg".to_string() } else { ext };
        }
    }

    "jpg".to_string()
}

fn mime_for(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_filename_strips_invalid_characters() {
        assert_eq!(
            clean_filename("What: a <great> read / part 2?"),
            "What a great read part 2"
        );
    }

    #[test]
    fn clean_filename_collapses_whitespace() {
        assert_eq!(clean_filename("  too   many\tspaces "), "too many spaces");
    }

    #[test]
    fn clean_filename_falls_back_to_untitled() {
        assert_eq!(clean_filename("???"), "Untitled");
        assert_eq!(clean_filename(""), "Untitled");
    }

    #[test]
    fn image_extension_sniffs_magic_bytes() {
        assert_eq!(image_extension("x", b"\x89PNG\r\n\x1a\n"), "png");
        assert_eq!(image_extension("x", &[0xff, 0xd8, 0xff, 0xe0]), "jpg");
        assert_eq!(image_extension("x", b"GIF89a"), "gif");
        assert_eq!(image_extension("x", b"RIFF\x00\x00\x00\x00WEBPVP8 "), "webp");
        assert_eq!(image_extension("x", b"<svg xmlns=\"...\">"), "svg");
    }

    #[test]
    fn image_extension_falls_back_to_url_then_jpg() {
        assert_eq!(image_extension("https://e.com/pic.webp?w=800", b"????"), "webp");
        assert_eq!(image_extension("https://e.com/pic.jpeg", b"????"), "jpg");
        assert_eq!(image_extension("https://e.com/pic", b"????"), "jpg");
    }

    #[test]
    fn chapter_has_title_heading_and_byline() {
        let xhtml = chapter_xhtml("Tools & Toys", Some("Ada"), "<p>hi</p>");
        assert!(xhtml.contains("<h1>Tools &amp; Toys</h1>"));
        assert!(xhtml.contains("<em>by Ada</em>"));
        assert!(xhtml.contains("<p>hi</p>"));
    }

    #[test]
    fn chapter_omits_byline_without_author() {
        let xhtml = chapter_xhtml("T", None, "<p>hi</p>");
        assert!(!xhtml.contains("<em>by"));
    }

    #[tokio::test]
    async fn missing_html_content_is_an_error() {
        let converter = DocumentConverter::new().unwrap();
        let document = crate::readwise::Document {
            id: "a".to_string(),
            title: Some("T".to_string()),
            author: None,
            category: Some("article".to_string()),
            location: None,
            source_url: None,
            html_content: None,
            tags: Vec::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let err = converter.prepare(&document, dir.path()).await.unwrap_err();
        assert!(matches!(err, ConvertError::MissingContent));
    }

    #[tokio::test]
    async fn pdf_without_source_url_is_an_error() {
        let converter = DocumentConverter::new().unwrap();
        let document = crate::readwise::Document {
            id: "a".to_string(),
            title: Some("T".to_string()),
            author: None,
            category: Some("pdf".to_string()),
            location: None,
            source_url: None,
            html_content: None,
            tags: Vec::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let err = converter.prepare(&document, dir.path()).await.unwrap_err();
        assert!(matches!(err, ConvertError::MissingSourceUrl));
    }

    #[tokio::test]
    async fn html_without_images_converts_to_epub_on_disk() {
        let converter = DocumentConverter::new().unwrap();
        let document = crate::readwise::Document {
            id: "a".to_string(),
            title: Some("A Great Read".to_string()),
            author: Some("Ada Lovelace".to_string()),
            category: Some("article".to_string()),
            location: Some("new".to_string()),
            source_url: None,
            html_content: Some("<p>Hello world</p>".to_string()),
            tags: Vec::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = converter.prepare(&document, dir.path()).await.unwrap();

        assert_eq!(path.file_name().unwrap(), "A Great Read.epub");
        let bytes = std::fs::read(&path).unwrap();
        // EPUBs are zip containers.
        assert_eq!(&bytes[..2], b"PK");
    }

    /// Serves `count` one-shot HTTP responses carrying a PNG body.
    fn serve_png(count: usize) -> std::net::SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            use std::io::{Read, Write};
            for _ in 0..count {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request);
                let png = b"\x89PNG\r\n\x1a\n_test_image_";
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    png.len()
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(png);
            }
        });
        addr
    }

    #[tokio::test]
    async fn image_src_is_rewritten_but_links_and_prose_are_not() {
        let addr = serve_png(2);
        let short = format!("http://{addr}/pic.png");
        let long = format!("http://{addr}/pic.png?w=800");
        let html = format!(
            r#"<a href="{short}"><img src="{short}"/></a><img src="{long}"/> See {short} for source."#
        );

        let converter = DocumentConverter::new().unwrap();
        let (rewritten, images) = converter.embed_images(&html).await;

        assert_eq!(images.len(), 2);
        assert_eq!(images[0].name, "img_0.png");
        assert_eq!(images[1].name, "img_1.png");
        assert!(rewritten
            .contains(r#"<img src="img_0.png" style="max-width: 100%; height: auto;"/>"#));
        assert!(rewritten
            .contains(r#"<img src="img_1.png" style="max-width: 100%; height: auto;"/>"#));
        // The anchor and the plain-text mention keep the original URL.
        assert!(rewritten.contains(&format!(r#"<a href="{short}">"#)));
        assert!(rewritten.contains(&format!("See {short} for source.")));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_image_does_not_fail_conversion() {
        // Bind and drop a listener to get a port that refuses connections.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let url = format!("http://{addr}/gone.png");
        let html = format!(r#"<p>Intro</p><img src="{url}"/>"#);

        let converter = DocumentConverter::new().unwrap();
        let (rewritten, images) = converter.embed_images(&html).await;
        assert!(images.is_empty());
        assert_eq!(rewritten, html);

        let document = crate::readwise::Document {
            id: "a".to_string(),
            title: Some("Flaky Images".to_string()),
            author: None,
            category: Some("article".to_string()),
            location: None,
            source_url: None,
            html_content: Some(html),
            tags: Vec::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = converter.prepare(&document, dir.path()).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "Flaky Images.epub");
    }
}

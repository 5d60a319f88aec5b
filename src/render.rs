//! Minimal HTML renderer used by the shipped binaries.
//!
//! Output is deterministic for a given page, so an unchanged page re-renders
//! to the same content hash.

use async_trait::async_trait;
use serde_json::json;

use crate::model::{NaturalKey, PageType};
use crate::paths;
use crate::source::{PageRenderer, RenderError};

#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    base_url: String,
    site_name: String,
}

struct Crumb {
    name: String,
    url: String,
}

struct PageData {
    path: String,
    meta_title: String,
    meta_description: String,
    h1: String,
    body: String,
    breadcrumbs: Vec<Crumb>,
    schema_type: &'static str,
}

impl TemplateRenderer {
    pub fn new(base_url: impl Into<String>, site_name: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            site_name: site_name.into(),
        }
    }

    fn page_data(&self, page_type: PageType, key: &NaturalKey) -> Result<PageData, RenderError> {
        let path = paths::canonical_path(page_type, key)
            .map_err(|e| RenderError::Failed(e.to_string()))?;
        let segs: Vec<&str> = key.segments().collect();
        let site = &self.site_name;
        let home = Crumb {
            name: "Home".into(),
            url: "/".into(),
        };

        let data = match (page_type, segs.as_slice()) {
            (PageType::State, [state]) => {
                let name = display_name(state);
                PageData {
                    meta_title: format!("Find Dentists in {name} | {site}"),
                    meta_description: format!(
                        "Find and book appointments with top-rated dentists in {name}. Compare verified clinics and schedule your visit today."
                    ),
                    h1: format!("Find Dentists in {name}"),
                    body: format!("Browse our directory of verified dental professionals in {name}."),
                    breadcrumbs: vec![home, crumb(&name, &path)],
                    schema_type: "WebPage",
                    path,
                }
            }
            (PageType::City, [state, city]) => {
                let (state_name, city_name) = (display_name(state), display_name(city));
                PageData {
                    meta_title: format!("Dentists in {city_name}, {state_name} | {site}"),
                    meta_description: format!(
                        "Find top-rated dentists in {city_name}, {state_name}. Compare clinics and book appointments online."
                    ),
                    h1: format!("Dentists in {city_name}, {state_name}"),
                    body: format!("Looking for a dentist in {city_name}? Browse our verified directory."),
                    breadcrumbs: vec![
                        home,
                        crumb(&state_name, &format!("/{state}/")),
                        crumb(&city_name, &path),
                    ],
                    schema_type: "WebPage",
                    path,
                }
            }
            (PageType::Service, [service]) => {
                let name = display_name(service);
                PageData {
                    meta_title: format!("{name} | Find Dental Specialists | {site}"),
                    meta_description: format!(
                        "Find dentists offering {name}. Compare providers and book your appointment online."
                    ),
                    h1: name.clone(),
                    body: format!("Find experienced dental professionals offering {name}."),
                    breadcrumbs: vec![home, crumb("Services", "/services/"), crumb(&name, &path)],
                    schema_type: "MedicalWebPage",
                    path,
                }
            }
            (PageType::ServiceLocation, [state, city, service]) => {
                let state_name = display_name(state);
                let city_name = display_name(city);
                let service_name = display_name(service);
                PageData {
                    meta_title: format!("{service_name} in {city_name}, {state_name} | {site}"),
                    meta_description: format!(
                        "Find {service_name} specialists in {city_name}, {state_name}. Compare providers and book your appointment."
                    ),
                    h1: format!("{service_name} in {city_name}, {state_name}"),
                    body: format!(
                        "Looking for {service_name} in {city_name}? Browse dental professionals offering this service in your area."
                    ),
                    breadcrumbs: vec![
                        home,
                        crumb(&state_name, &format!("/{state}/")),
                        crumb(&city_name, &format!("/{state}/{city}/")),
                        crumb(&service_name, &path),
                    ],
                    schema_type: "MedicalWebPage",
                    path,
                }
            }
            (PageType::EntityDetail, [slug]) => {
                let name = display_name(slug);
                PageData {
                    meta_title: format!("{name} | Dental Clinic | {site}"),
                    meta_description: format!("{name} is a dental clinic. Book your appointment online."),
                    h1: name.clone(),
                    body: format!("{name} offers quality dental care. Book your appointment online today."),
                    breadcrumbs: vec![home, crumb(&name, &path)],
                    schema_type: "Dentist",
                    path,
                }
            }
            _ => return Err(RenderError::NotFound(key.to_string())),
        };
        Ok(data)
    }

    fn to_html(&self, page: &PageData) -> String {
        let url = format!("{}{}", self.base_url, page.path);
        let title = escape_html(&page.meta_title);
        let description = escape_html(&page.meta_description);
        let breadcrumbs = page
            .breadcrumbs
            .iter()
            .map(|c| format!("<a href=\"{}\">{}</a>", escape_html(&c.url), escape_html(&c.name)))
            .collect::<Vec<_>>()
            .join(" &gt; ");
        let structured = json!({
            "@context": "https://schema.org",
            "@type": page.schema_type,
            "name": page.h1,
            "url": url,
        })
        .to_string()
        .replace("</", "<\\/");

        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>{title}</title>
  <meta name="description" content="{description}">
  <link rel="canonical" href="{url}">
  <meta property="og:title" content="{title}">
  <meta property="og:description" content="{description}">
  <meta property="og:type" content="website">
  <meta property="og:url" content="{url}">
  <meta property="og:site_name" content="{site}">
  <meta name="robots" content="index, follow">
  <script type="application/ld+json">{structured}</script>
</head>
<body>
  <nav class="breadcrumbs">{breadcrumbs}</nav>
  <main>
    <h1>{h1}</h1>
    <div class="content"><p>{body}</p></div>
    <a href="{url}" class="cta">Book an Appointment</a>
  </main>
</body>
</html>
"#,
            site = escape_html(&self.site_name),
            h1 = escape_html(&page.h1),
            body = escape_html(&page.body),
        )
    }
}

#[async_trait]
impl PageRenderer for TemplateRenderer {
    async fn render(&self, page_type: PageType, key: &NaturalKey) -> Result<String, RenderError> {
        let page = self.page_data(page_type, key)?;
        Ok(self.to_html(&page))
    }
}

fn crumb(name: &str, url: &str) -> Crumb {
    Crumb {
        name: name.to_string(),
        url: url.to_string(),
    }
}

/// `abu-dhabi` -> `Abu Dhabi`.
pub fn display_name(slug: &str) -> String {
    slug.split('-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> TemplateRenderer {
        TemplateRenderer::new("https://www.example.com/", "Example <Dental>")
    }

    #[tokio::test]
    async fn renders_service_location_page() {
        let html = renderer()
            .render(PageType::ServiceLocation, &NaturalKey::new("dubai/marina/teeth-whitening"))
            .await
            .unwrap();
        assert!(html.contains("<h1>Teeth Whitening in Marina, Dubai</h1>"));
        assert!(html.contains(r#"<link rel="canonical" href="https://www.example.com/dubai/marina/teeth-whitening/">"#));
        assert!(html.contains(r#"<a href="/dubai/marina/">Marina</a>"#));
        assert!(html.contains("Example &lt;Dental&gt;"));
        assert!(html.contains(r#"content="index, follow""#));
    }

    #[tokio::test]
    async fn render_is_deterministic() {
        let r = renderer();
        let key = NaturalKey::new("implants");
        let a = r.render(PageType::Service, &key).await.unwrap();
        let b = r.render(PageType::Service, &key).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn malformed_key_fails() {
        let err = renderer()
            .render(PageType::City, &NaturalKey::new("dubai"))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Failed(_)));
    }

    #[test]
    fn helpers() {
        assert_eq!(display_name("abu-dhabi"), "Abu Dhabi");
        assert_eq!(escape_html(r#"<a href="x">'&'</a>"#), "&lt;a href=&quot;x&quot;&gt;&#039;&amp;&#039;&lt;/a&gt;");
    }
}

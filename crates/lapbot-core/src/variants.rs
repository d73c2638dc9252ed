//! HTML parsing for product pages and category listings.

use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::AppError;
use crate::models::VariantRecord;

const ROOT_ID_SELECTOR: &str = "#block-comment-cps";
const ROOT_ID_ATTR: &str = "product-id";
const VARIANT_SELECTOR: &str = ".list-variants li";
const VARIANT_ID_ATTR: &str = "data-product-id";
const VARIANT_COLOR_SELECTOR: &str = "strong.item-variant-name";
const VARIANT_PRICE_SELECTOR: &str = "span.item-variant-price";
const FEATURE_SELECTOR: &str = ".mobile ul li";
const LISTING_LINK_SELECTOR: &str = ".block-product-list-filter a.product__link";

/// Separator between the special features of one page.
pub const FEATURE_SEPARATOR: &str = "|";

pub(crate) fn selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css).map_err(|e| AppError::Generic(format!("invalid selector '{css}': {e}")))
}

fn first_attr(element: ElementRef<'_>, css: &Selector, attr: &str) -> String {
    element
        .select(css)
        .next()
        .and_then(|e| e.value().attr(attr))
        .unwrap_or_default()
        .to_string()
}

fn first_text(element: ElementRef<'_>, css: &Selector) -> String {
    element
        .select(css)
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

/// Returns true when `url` starts with one of `prefixes`.
pub fn is_valid_product_url<S: AsRef<str>>(url: &str, prefixes: &[S]) -> bool {
    let url = url.trim();
    !url.is_empty() && prefixes.iter().any(|p| url.starts_with(p.as_ref()))
}

/// Extracts every color/configuration option of a product page.
///
/// All variants share the page's root product id, its special features and
/// `page_url`. A page without a variant list yields no records.
pub fn parse_variants(html: &str, page_url: &str) -> Result<Vec<VariantRecord>, AppError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let root_id_sel = selector(ROOT_ID_SELECTOR)?;
    let variant_sel = selector(VARIANT_SELECTOR)?;
    let img_sel = selector("img")?;
    let link_sel = selector("a")?;
    let color_sel = selector(VARIANT_COLOR_SELECTOR)?;
    let price_sel = selector(VARIANT_PRICE_SELECTOR)?;
    let feature_sel = selector(FEATURE_SELECTOR)?;

    let root_product_id = first_attr(root, &root_id_sel, ROOT_ID_ATTR);
    let special_features = document
        .select(&feature_sel)
        .map(|li| li.text().collect::<String>().trim().to_string())
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>()
        .join(FEATURE_SEPARATOR);

    let variants = document
        .select(&variant_sel)
        .map(|variant| VariantRecord {
            root_product_id: root_product_id.clone(),
            child_product_id: variant
                .value()
                .attr(VARIANT_ID_ATTR)
                .unwrap_or_default()
                .to_string(),
            name: first_attr(variant, &img_sel, "alt"),
            link: first_attr(variant, &link_sel, "href"),
            image: first_attr(variant, &img_sel, "src"),
            color: first_text(variant, &color_sel),
            price: first_text(variant, &price_sel),
            special_features: special_features.clone(),
            url: page_url.to_string(),
        })
        .collect();

    Ok(variants)
}

/// Product links of a category listing page, absolute and deduplicated in
/// page order.
///
/// # Errors
///
/// Returns [`AppError::InvalidUrl`] when `base_url` cannot be parsed.
pub fn parse_listing_links(html: &str, base_url: &str) -> Result<Vec<String>, AppError> {
    let base = Url::parse(base_url)
        .map_err(|e| AppError::InvalidUrl(format!("{base_url}: {e}")))?;
    let document = Html::parse_document(html);
    let link_sel = selector(LISTING_LINK_SELECTOR)?;

    let mut seen = HashSet::new();
    let links = document
        .select(&link_sel)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| {
            !href.is_empty() && !href.starts_with('#') && !href.starts_with("javascript:")
        })
        .filter_map(|href| base.join(href).ok())
        .map(|url| url.to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect();

    Ok(links)
}

//! Turns raw catalog JSON into flat CSV rows.

use std::collections::BTreeSet;

use scraper::Html;
use serde_json::Value;

use crate::models::QaRecord;
use crate::table::Record;

/// Separator between multi-valued category and filter fields.
pub const LIST_SEPARATOR: &str = "|";

/// Separator between the answers of one question.
pub const ANSWER_SEPARATOR: &str = " ||| ";

/// Fixed product columns, written before the attribute columns.
pub const PRODUCT_COLUMNS: &[&str] = &[
    "product_id",
    "name",
    "sku",
    "manufacturer",
    "url_key",
    "url_path",
    "doc_quyen",
    "average_rating",
    "total_count",
    "category_id",
    "category_name",
    "is_installment",
    "price",
    "special_price",
    "thumbnail",
    "is_parent",
    "stock_available_id",
    "company_stock_id",
    "filter_id",
    "filter_label",
    "promotion_information",
    "root_price",
    "smem_price",
    "smem_student_price",
    "smem_teacher_price",
    "snew_student_price",
    "snew_teacher_price",
    "snull_student",
    "snull_teacher",
    "special_prices",
];

/// `(column, price tier)` pairs stored as compact JSON.
const PRODUCT_PRICE_TIERS: &[(&str, &str)] = &[
    ("root_price", "root"),
    ("smem_price", "smem"),
    ("smem_student_price", "smem_student"),
    ("smem_teacher_price", "smem_teacher"),
    ("snew_student_price", "snew_student"),
    ("snew_teacher_price", "snew_teacher"),
    ("snull_student", "snull_student"),
    ("snull_teacher", "snull_teacher"),
    ("special_prices", "special"),
];

/// Fixed accessory columns, written before the `attr_*` columns.
pub const ADDON_COLUMNS: &[&str] = &[
    "root_laptop_id",
    "addon_product_id",
    "addon_url_path",
    "addon_product_name",
    "addon_product_child",
    "doc_quyen",
    "addon_category_ids",
    "addon_category_names",
    "addon_category_level",
    "addon_category_similars",
    "addon_stock_available_id",
    "addon_company_stock_id",
    "addon_is_parent",
    "addon_price",
    "addon_root_price",
    "addon_smem_price",
    "addon_snew_price",
    "addon_special_price",
    "addon_svip_price",
    "addon_thumbnail",
    "addon_promotion_info",
];

const ADDON_PRICE_TIERS: &[(&str, &str)] = &[
    ("addon_root_price", "root"),
    ("addon_smem_price", "smem"),
    ("addon_snew_price", "snew"),
    ("addon_special_price", "special"),
    ("addon_svip_price", "svip"),
];

/// Decodes entities, strips tags and collapses whitespace.
///
/// ```
/// use lapbot_core::flatten::clean_html;
///
/// assert_eq!(clean_html("<p>Intel&reg; Core\n  i5</p>"), "Intel® Core i5");
/// ```
pub fn clean_html(raw: &str) -> String {
    let fragment = Html::parse_fragment(raw);
    let text: String = fragment.root_element().text().collect();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Column name of a dynamic attribute: `Screen-Size` → `attr_screen_size`.
pub fn attr_column_name(code: &str) -> String {
    format!("attr_{}", code.to_lowercase().replace([' ', '-'], "_"))
}

/// Fixed columns first, then the dynamic ones sorted, without duplicates.
pub fn union_columns<I>(fixed: &[&str], dynamic: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let fixed_set: BTreeSet<&str> = fixed.iter().copied().collect();
    let dynamic: BTreeSet<String> = dynamic
        .into_iter()
        .map(|c| c.as_ref().to_string())
        .filter(|c| !fixed_set.contains(c.as_str()))
        .collect();
    fixed
        .iter()
        .map(|c| c.to_string())
        .chain(dynamic)
        .collect()
}

/// Scalar as plain text; `null` and absent values are empty.
fn text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Attribute value as a cell: strings cleaned, containers as compact JSON.
fn attribute_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => clean_html(s),
        Value::Array(_) | Value::Object(_) => value.to_string(),
        other => other.to_string(),
    }
}

fn join_field(items: Option<&Value>, key: &str) -> String {
    items
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.is_object())
                .map(|item| text(item.get(key)))
                .collect::<Vec<_>>()
                .join(LIST_SEPARATOR)
        })
        .unwrap_or_default()
}

fn price_tier(prices: Option<&Value>, tier: &str) -> String {
    match prices.and_then(|p| p.get(tier)) {
        Some(Value::Null) | None => "{}".to_string(),
        Some(value) => value.to_string(),
    }
}

fn put(record: &mut Record, column: &str, value: String) {
    record.insert(column.to_string(), value);
}

/// Flattens one product from the catalog query.
///
/// Every entry of `general.attributes` becomes a column of the same name;
/// a fixed column keeps its value unless it is empty.
pub fn flatten_product(product: &Value) -> Record {
    let general = product.get("general").unwrap_or(&Value::Null);
    let filterable = product.get("filterable").unwrap_or(&Value::Null);
    let review = general.get("review");
    let prices = filterable.get("prices").filter(|p| p.is_object());

    let mut record = Record::new();
    for column in [
        "product_id",
        "name",
        "sku",
        "manufacturer",
        "url_key",
        "url_path",
        "doc_quyen",
    ] {
        put(&mut record, column, text(general.get(column)));
    }
    put(
        &mut record,
        "average_rating",
        text(review.and_then(|r| r.get("average_rating"))),
    );
    put(
        &mut record,
        "total_count",
        text(review.and_then(|r| r.get("total_count"))),
    );
    put(
        &mut record,
        "category_id",
        join_field(general.get("categories"), "categoryId"),
    );
    put(
        &mut record,
        "category_name",
        join_field(general.get("categories"), "name"),
    );
    for column in [
        "is_installment",
        "price",
        "special_price",
        "thumbnail",
        "is_parent",
        "stock_available_id",
        "company_stock_id",
    ] {
        put(&mut record, column, text(filterable.get(column)));
    }
    put(&mut record, "filter_id", join_field(filterable.get("filter"), "id"));
    put(
        &mut record,
        "filter_label",
        join_field(filterable.get("filter"), "Label"),
    );
    put(
        &mut record,
        "promotion_information",
        clean_html(&text(filterable.get("promotion_information"))),
    );
    for (column, tier) in PRODUCT_PRICE_TIERS {
        put(&mut record, column, price_tier(prices, tier));
    }

    if let Some(attributes) = general.get("attributes").and_then(Value::as_object) {
        for (code, value) in attributes {
            let cell = attribute_cell(value);
            let keep_fixed = record.get(code).is_some_and(|existing| !existing.is_empty());
            if !keep_fixed {
                record.insert(code.clone(), cell);
            }
        }
    }

    record
}

/// Flattens one question thread; answers are joined with
/// [`ANSWER_SEPARATOR`].
pub fn flatten_comment(comment: &Value) -> QaRecord {
    let customer = comment.get("customer").filter(|c| c.is_object());

    let mut contents = Vec::new();
    let mut created = Vec::new();
    let mut names = Vec::new();
    let mut ids = Vec::new();
    let mut admin_flags = Vec::new();

    if let Some(children) = comment.get("children").and_then(Value::as_array) {
        for child in children.iter().filter(|c| c.is_object()) {
            contents.push(text(child.get("content")));
            created.push(text(child.get("created_at")));
            admin_flags.push(match child.get("is_admin") {
                None | Some(Value::Null) => "0".to_string(),
                value => text(value),
            });
            match child.get("customer").filter(|c| c.is_object()) {
                Some(answerer) => {
                    names.push(match answerer.get("fullname") {
                        None | Some(Value::Null) => "N/A".to_string(),
                        value => text(value),
                    });
                    ids.push(text(answerer.get("id")));
                }
                None => {
                    names.push("N/A".to_string());
                    ids.push(String::new());
                }
            }
        }
    }

    QaRecord {
        comment_id: text(comment.get("id")),
        question: text(comment.get("content")),
        page_name: text(comment.get("page_name")),
        question_sent_from: text(comment.get("sent_from")),
        question_created_at: text(comment.get("created_at")),
        product_id: text(comment.get("product_id")),
        page_url: text(comment.get("page_url")),
        customer_id: text(customer.and_then(|c| c.get("id"))),
        customer_fullname: text(customer.and_then(|c| c.get("fullname"))),
        answer_contents: contents.join(ANSWER_SEPARATOR),
        answer_created_at: created.join(ANSWER_SEPARATOR),
        answerer_names: names.join(ANSWER_SEPARATOR),
        answerer_ids: ids.join(ANSWER_SEPARATOR),
        is_admin: admin_flags.join(ANSWER_SEPARATOR),
    }
}

/// Flattens an accessory recommended for `root_id`.
///
/// Attributes become `attr_*` columns (see [`attr_column_name`]).
pub fn flatten_addon(root_id: &str, product: &Value) -> Record {
    let general = product.get("general").unwrap_or(&Value::Null);
    let filterable = product.get("filterable").unwrap_or(&Value::Null);
    let prices = filterable.get("prices").filter(|p| p.is_object());
    let categories = general.get("categories");

    let mut record = Record::new();
    put(&mut record, "root_laptop_id", root_id.to_string());
    put(&mut record, "addon_product_id", text(general.get("product_id")));
    put(&mut record, "addon_url_path", text(general.get("url_path")));
    put(&mut record, "addon_product_name", text(general.get("name")));
    put(
        &mut record,
        "addon_product_child",
        general
            .get("child_product")
            .filter(|c| !c.is_null())
            .map(Value::to_string)
            .unwrap_or_else(|| "[]".to_string()),
    );
    put(&mut record, "doc_quyen", text(general.get("doc_quyen")));
    put(&mut record, "addon_category_ids", join_field(categories, "categoryId"));
    put(&mut record, "addon_category_names", join_field(categories, "name"));
    put(&mut record, "addon_category_level", join_field(categories, "level"));
    put(
        &mut record,
        "addon_category_similars",
        join_field(categories, "similar"),
    );
    put(
        &mut record,
        "addon_stock_available_id",
        text(filterable.get("stock_available_id")),
    );
    put(
        &mut record,
        "addon_company_stock_id",
        text(filterable.get("company_stock_id")),
    );
    put(&mut record, "addon_is_parent", text(filterable.get("is_parent")));
    put(&mut record, "addon_price", text(filterable.get("price")));
    for (column, tier) in ADDON_PRICE_TIERS {
        put(&mut record, column, price_tier(prices, tier));
    }
    put(&mut record, "addon_thumbnail", text(filterable.get("thumbnail")));
    put(
        &mut record,
        "addon_promotion_info",
        clean_html(&text(filterable.get("promotion_information"))),
    );

    if let Some(attributes) = general.get("attributes").and_then(Value::as_object) {
        for (code, value) in attributes {
            record.insert(attr_column_name(code), attribute_cell(value));
        }
    }

    record
}

/// Dynamic (non-fixed) columns of a set of rows.
pub fn dynamic_columns<'a, I>(fixed: &[&str], records: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a Record>,
{
    records
        .into_iter()
        .flat_map(|r| r.keys())
        .filter(|k| !fixed.contains(&k.as_str()))
        .cloned()
        .collect()
}

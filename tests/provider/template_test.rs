//! Provider payload rendering.

use chrono::Utc;
use serde_json::json;

use campaign_dispatch::provider::{render, TemplateError};
use campaign_dispatch::store::{Campaign, CampaignStatus};

fn campaign(body: &str) -> Campaign {
    Campaign {
        id: "camp-1".to_owned(),
        org_id: "org-1".to_owned(),
        name: "promo".to_owned(),
        template_name: "promo_v1".to_owned(),
        language_code: "pt_BR".to_owned(),
        body_text: body.to_owned(),
        status: CampaignStatus::Running,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[test]
fn payload_lists_parameters_as_body_component() {
    let params = vec!["Ana".to_owned(), "20%".to_owned()];
    let rendered = render(&campaign("Oi {{1}}, {{2}} off"), &params).expect("render");

    assert_eq!(rendered.preview, "Oi Ana, 20% off");
    assert_eq!(
        rendered.template,
        json!({
            "name": "promo_v1",
            "language": { "code": "pt_BR" },
            "components": [{
                "type": "body",
                "parameters": [
                    { "type": "text", "text": "Ana" },
                    { "type": "text", "text": "20%" }
                ]
            }]
        })
    );
}

#[test]
fn no_parameters_means_no_components() {
    let rendered = render(&campaign("Static text"), &[]).expect("render");
    assert!(rendered.template.get("components").is_none());
    assert_eq!(rendered.preview, "Static text");
}

#[test]
fn missing_template_name_is_rejected() {
    let mut c = campaign("x");
    c.template_name = "  ".to_owned();
    assert!(matches!(
        render(&c, &[]),
        Err(TemplateError::MissingTemplateName(id)) if id == "camp-1"
    ));
}

#[test]
fn unfilled_placeholder_is_rejected() {
    let err = render(&campaign("{{1}} and {{3}}"), &["a".to_owned(), "b".to_owned()])
        .expect_err("should fail");
    assert_eq!(
        err,
        TemplateError::MissingParameter {
            index: 3,
            provided: 2
        }
    );
}

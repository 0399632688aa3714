use mailkeep::sanitize::extract_fields;

#[test]
fn html_only_message_is_flattened_and_inline_images_are_not_attachments() {
    let raw = concat!(
        "From: \"Ops Team\" <ops@example.com>\r\n",
        "To: a@example.com, b@example.com\r\n",
        "Cc: c@example.com\r\n",
        "Subject: =?UTF-8?B?V2Vla2x5IHJlcG9ydA==?=\r\n",
        "Date: Mon, 30 Jun 2025 23:15:00 -0200\r\n",
        "Content-Type: multipart/related; boundary=\"r\"\r\n",
        "\r\n",
        "--r\r\n",
        "Content-Type: text/html; charset=utf-8\r\n",
        "\r\n",
        "<p>Totals&nbsp;attached</p><p>Regards</p>\r\n",
        "--r\r\n",
        "Content-Type: image/png\r\n",
        "Content-Disposition: inline; filename=\"logo.png\"\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "iVBORw0KGgo=\r\n",
        "--r\r\n",
        "Content-Type: application/pdf; name=\"totals.pdf\"\r\n",
        "Content-Disposition: attachment; filename=\"totals.pdf\"\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "SGVsbG8=\r\n",
        "--r--\r\n",
    );

    let fields = extract_fields(raw.as_bytes()).unwrap();
    assert_eq!(fields.sender, "\"Ops Team\" <ops@example.com>");
    assert_eq!(fields.to, "a@example.com, b@example.com");
    assert_eq!(fields.cc, "c@example.com");
    assert_eq!(fields.subject, "Weekly report");
    assert_eq!(fields.date, "2025-07-01 01:15:00");
    assert!(fields.body.contains("Totals attached"));
    assert!(fields.body.contains("Regards"));
    assert!(fields.has_attachments);
    assert_eq!(fields.attachment_count, 1);
}

#[test]
fn unparseable_date_is_kept_verbatim_and_missing_headers_are_empty() {
    let raw = b"Date: sometime last week\r\n\r\nbody\r\n";
    let fields = extract_fields(raw).unwrap();
    assert_eq!(fields.date, "sometime last week");
    assert_eq!(fields.sender, "");
    assert_eq!(fields.subject, "");
    assert_eq!(fields.body, "body");
    assert!(!fields.has_attachments);
}

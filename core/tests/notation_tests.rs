use mathcore::notation::{decode, encode, from_markup, notation_to_markup, to_markup, MathNode};

#[test]
fn harvested_markup_becomes_notation() {
    let markup = r#"<math xmlns="http://www.w3.org/1998/Math/MathML" alttext="\zeta(z)">
      <mrow>
        <mi>ζ</mi>
        <mo>&#x2062;</mo>
        <mrow><mo stretchy="false">(</mo><mi>z</mi><mo stretchy="false">)</mo></mrow>
      </mrow>
    </math>"#;
    let tree = from_markup(markup).unwrap();
    assert_eq!(encode(&tree), "mrow(mi:ζ,mo:ivt,mrow(mo:(,mi:z,mo:)))");
    assert_eq!(to_markup(&tree), notation_to_markup("mrow(mi:ζ,mo:ivt,mrow(mo:(,mi:z,mo:)))").unwrap());
}

#[test]
fn built_trees_round_trip() {
    let tree = MathNode::node(
        "mrow",
        vec![
            MathNode::leaf("mi", "f"),
            MathNode::leaf("mo", "\u{2061}"),
            MathNode::node("mrow", vec![MathNode::leaf("mo", "("), MathNode::leaf("mi", "x"), MathNode::leaf("mo", ")")]),
            MathNode::node("msup", vec![MathNode::leaf("mi", "e"), MathNode::leaf("mn", "2")]),
        ],
    );
    let encoded = encode(&tree);
    assert_eq!(encoded, "mrow(mi:f,mo:fap,mrow(mo:(,mi:x,mo:)),msup(mi:e,mn:2))");
    assert_eq!(decode(&encoded).unwrap(), tree);
    assert_eq!(tree.depth(), 3);
}

#[test]
fn error_reports_position() {
    let err = decode("mrow(mi:x").unwrap_err();
    assert!(err.to_string().contains("byte"));
}

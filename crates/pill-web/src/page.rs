use pill_proto::{InputGrid, RenderModel};

const HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Pill Counter</title>

<style>
body {
    font-family: Arial, sans-serif;
    background: #f0f2f5;
    text-align: center;
}

.card {
    background: white;
    max-width: 420px;
    margin: 30px auto;
    padding: 20px;
    border-radius: 14px;
    box-shadow: 0 10px 25px rgba(0,0,0,0.15);
}

canvas {
    position: absolute;
    top: 0;
    left: 0;
}

.img-wrapper {
    position: relative;
    display: inline-block;
    margin-top: 15px;
}
</style>
</head>

<body>
<div class="card">
<h2>💊 Assistive Pill Counter</h2>
<p>Edge Impulse • Constrained Object Detection</p>

<form method="POST" action="/predict" enctype="multipart/form-data">
<input type="file" name="image" accept="image/*" capture="environment" required>
<br><br>
<button type="submit">Count Pills</button>
</form>
"#;

const RESULT: &str = r#"
<h3>Pills detected: {{count}}</h3>

<div class="img-wrapper">
    <img id="img" src="/{{image_path}}" width="320">
    <canvas id="canvas"></canvas>
</div>

<script>
const boxes = {{boxes}};
const gridW = {{grid_w}};
const gridH = {{grid_h}};
const img = document.getElementById("img");
const canvas = document.getElementById("canvas");
const ctx = canvas.getContext("2d");

function draw() {
    canvas.width = img.width;
    canvas.height = img.height;

    const scaleX = img.width / gridW;
    const scaleY = img.height / gridH;

    ctx.strokeStyle = "lime";
    ctx.lineWidth = 2;
    ctx.font = "14px Arial";
    ctx.fillStyle = "lime";

    boxes.forEach(b => {
        const x = b.x * scaleX;
        const y = b.y * scaleY;
        const w = b.w * scaleX;
        const h = b.h * scaleY;

        ctx.strokeRect(x, y, w, h);
        ctx.fillText("pill " + b.score.toFixed(2), x, y - 4);
    });
}

if (img.complete) { draw(); } else { img.onload = draw; }
</script>
"#;

const TAIL: &str = "</div>\n</body>\n</html>\n";

/// Upload form, plus the count and canvas overlay when there is a result.
/// Box coordinates are in model input space, scaled against `grid` client side.
pub fn render_page(result: Option<&RenderModel>, grid: InputGrid) -> String {
    let mut out = String::with_capacity(HEAD.len() + RESULT.len() + 256);
    out.push_str(HEAD);
    if let Some(model) = result {
        out.push_str(
            &RESULT
                .replace("{{count}}", &model.count.to_string())
                .replace("{{image_path}}", &escape_html(&model.image_path))
                .replace("{{boxes}}", &script_json(model))
                .replace("{{grid_w}}", &grid.width.to_string())
                .replace("{{grid_h}}", &grid.height.to_string()),
        );
    }
    out.push_str(TAIL);
    out
}

// a data literal inside <script>, so the only hazard is a closing tag
fn script_json(model: &RenderModel) -> String {
    serde_json::to_string(&model.boxes)
        .unwrap_or_else(|_| "[]".into())
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
